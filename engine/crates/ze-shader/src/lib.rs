//! shader permutation 系统
//!
//! - [`ShaderManager`] 按名字加载 TOML 定义与源码，缓存 [`Shader`]
//! - [`Shader`] 按选项位缓存 [`ShaderPermutation`]
//! - [`ShaderPermutation`] 在 [`JobSystem`] 上异步编译所有 stage，`get_shader_map` 阻塞等待结果
//! - [`ShaderInstance`] 把资源的 bindless 索引写入 push constant 并绑定到 command list

pub mod compiler;
pub mod definition;
pub mod error;
pub mod file_system;
pub mod instance;
pub mod job;
pub mod manager;
pub mod shader;

pub use compiler::{CompiledShader, PassthroughShaderCompiler, ReflectedResource, ShaderCompiler, ShaderReflection};
pub use definition::{PermutationId, ShaderDefinition};
pub use error::ShaderError;
pub use file_system::{FileSystem, FileSystemError, MemoryFileSystem, NativeFileSystem};
pub use instance::ShaderInstance;
pub use job::{JobGroup, JobHandle, JobSystem};
pub use manager::ShaderManager;
pub use shader::{Shader, ShaderMap, ShaderPermutation};

#[cfg(test)]
mod tests;
