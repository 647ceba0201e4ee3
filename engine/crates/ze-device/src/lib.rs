//! ze 的 Device 层
//!
//! 在 `ze_gfx::BackendDevice` 之上提供资源池、帧生命周期与延迟销毁、command list 状态追踪、
//! render pass 与 pipeline 缓存，以及全局的 bindless descriptor 表。

pub mod bindless;
pub mod command_list;
pub mod command_pool;
pub mod device;
pub mod error;
pub mod frame;
pub mod handles;
pub mod pass_info;
pub mod pipeline_cache;
pub mod resource_pool;
pub mod resources;
pub mod retirement;
pub mod settings;

pub use bindless::{BindlessDescriptorType, DescriptorIndexHandle, DescriptorIndexManager};
pub use command_list::CommandList;
pub use device::Device;
pub use error::DeviceError;
pub use handles::*;
pub use pass_info::{
    BufferBarrierInfo, ColorAttachmentInfo, DepthStencilAttachmentInfo, RenderPassInfo, TextureBarrierInfo,
};
pub use resources::{BufferCreateInfo, PipelineLayoutDesc, SwapchainCreateInfo, TextureCreateInfo, TextureViewCreateInfo};
pub use settings::DeviceSettings;
