//! ze 的 GFX 抽象层
//!
//! - [`handle`]：带类型标记的后端资源句柄
//! - [`backend`]：后端设备契约 [`BackendDevice`] 以及按名字查找后端的 [`BackendRegistry`]
//! - [`headless`]：不依赖 GPU 的后端，记录所有调用，主要用于测试
//!
//! 其余模块是跨后端共享的值类型：格式、用途标记、管线状态以及各种 create info。

pub mod backend;
pub mod commands;
pub mod create_info;
pub mod descriptor;
pub mod format;
pub mod handle;
pub mod headless;
pub mod result;
pub mod types;

pub use backend::{Backend, BackendDevice, BackendRegistry, SwapchainDesc};
pub use format::{Format, ShaderLanguage, ShaderModel, ShaderStage, ShaderStageFlags};
pub use handle::{DeviceResourceHandle, DeviceResourceType, RawResourceHandle, ResourceKind};
pub use result::{GfxError, GfxResult};
