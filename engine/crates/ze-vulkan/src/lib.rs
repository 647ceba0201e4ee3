//! ze 的 Vulkan 后端
//!
//! 基于 ash 与 vk-mem 实现 [`ze_gfx::BackendDevice`]。要求 Vulkan 1.2 以及 descriptor indexing，
//! 交换链只有在创建设备时提供了 display handle 才可用。

mod backend_device;
mod conv;
pub mod debug_messenger;
pub mod device;
pub mod instance;
mod objects;
mod pipeline;
mod swapchain;

use std::sync::Arc;

use ze_gfx::{Backend, BackendDevice, GfxError, create_info::DeviceCreateInfo};

pub use device::VulkanBackendDevice;

/// 以 [`VulkanBackend::NAME`] 注册到 [`ze_gfx::BackendRegistry`]
#[derive(Debug, Default, Clone, Copy)]
pub struct VulkanBackend;

impl VulkanBackend {
    pub const NAME: &'static str = "vulkangfx";
}

impl Backend for VulkanBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn create_device(&self, info: &DeviceCreateInfo) -> Result<Arc<dyn BackendDevice>, GfxError> {
        let device = VulkanBackendDevice::new(info)?;
        log::info!("backend {} ready on {}", Self::NAME, device.gpu_name());
        Ok(Arc::new(device))
    }
}

#[cfg(test)]
mod tests {
    use ze_gfx::BackendRegistry;

    use super::*;

    #[test]
    fn test_registered_by_name() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(VulkanBackend));
        assert!(registry.get(VulkanBackend::NAME).is_some());
        assert!(registry.names().any(|name| name == "vulkangfx"));
    }
}
