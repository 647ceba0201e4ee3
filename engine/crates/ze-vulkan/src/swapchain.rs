use ash::vk;
use itertools::Itertools;
use ze_gfx::{
    Format, GfxError, GfxResult, SwapchainDesc,
    create_info::SwapchainCreateInfo,
    handle::{RawSemaphoreHandle, RawSwapchainHandle},
    types::QueueType,
};

use crate::{
    conv::{self, vk_error},
    device::{VulkanBackendDevice, VulkanSwapchain, VulkanTexture},
};

/// 确定交换链的 extent 尺寸
///
/// 如果 current_extent 是特殊值 0xFFFFFFFF，表示可以自己设置交换链的 extent
pub(crate) fn swapchain_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width == u32::MAX || caps.current_extent.height == u32::MAX {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    } else {
        caps.current_extent
    }
}

/// max_image_count == 0 表示不限制 image 数量
pub(crate) fn swapchain_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    if caps.max_image_count == 0 {
        caps.min_image_count + 1
    } else {
        u32::min(caps.max_image_count, caps.min_image_count + 1)
    }
}

/// 优先使用期望的格式，否则使用第一个能表示的格式
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR], preferred: Format) -> Option<(vk::SurfaceFormatKHR, Format)> {
    let preferred_vk = conv::format(preferred);
    formats
        .iter()
        .find(|format| format.format == preferred_vk && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.iter().find(|format| conv::format_from_vk(format.format).is_some()))
        .and_then(|format| conv::format_from_vk(format.format).map(|ze| (*format, ze)))
}

fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

// Swapchain API
impl VulkanBackendDevice {
    pub(crate) fn create_vk_swapchain(&self, info: &SwapchainCreateInfo) -> Result<RawSwapchainHandle, GfxError> {
        let _span = tracy_client::span!("VulkanBackendDevice::create_swapchain");
        if !self.instance.surface_enabled {
            return Err(GfxError::invalid_parameter(
                "swapchain requested but the device was created without a display handle",
            ));
        }
        let swapchain_loader = self.swapchain_loader()?;

        let surface = unsafe {
            ash_window::create_surface(
                &self.instance.entry,
                &self.instance.instance,
                info.display_handle,
                info.window_handle,
                None,
            )
        }
        .map_err(vk_error)?;

        match self.create_swapchain_for_surface(swapchain_loader, surface, info) {
            Ok(swapchain) => {
                let desc = swapchain.desc;
                let handle = self.swapchains.insert(swapchain);
                log::info!(
                    "swapchain created: {:?} {}x{}, {} images",
                    desc.format,
                    desc.width,
                    desc.height,
                    desc.image_count
                );
                Ok(handle)
            }
            Err(e) => {
                unsafe { self.surface_loader.destroy_surface(surface, None) };
                Err(e)
            }
        }
    }

    fn create_swapchain_for_surface(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        info: &SwapchainCreateInfo,
    ) -> Result<VulkanSwapchain, GfxError> {
        let pdevice = self.pdevice.handle;
        let gfx_family = self.queue(QueueType::Gfx).family;
        let supported = unsafe {
            self.surface_loader.get_physical_device_surface_support(pdevice, gfx_family, surface)
        }
        .map_err(vk_error)?;
        if !supported {
            return Err(GfxError::InitializationFailed("graphics queue cannot present to the surface".to_string()));
        }

        let caps =
            unsafe { self.surface_loader.get_physical_device_surface_capabilities(pdevice, surface) }.map_err(vk_error)?;
        let formats =
            unsafe { self.surface_loader.get_physical_device_surface_formats(pdevice, surface) }.map_err(vk_error)?;
        let modes = unsafe { self.surface_loader.get_physical_device_surface_present_modes(pdevice, surface) }
            .map_err(vk_error)?;

        let (surface_format, format) = choose_surface_format(&formats, info.preferred_format)
            .ok_or_else(|| GfxError::InitializationFailed("no supported surface format".to_string()))?;
        let present_mode = choose_present_mode(&modes, info.vsync);
        let extent = swapchain_extent(&caps, info.width, info.height);
        log::info!(
            "create swapchain:
            surface current extent: {}x{}, min extent: {}x{}, max extent: {}x{}
            window extent: {}x{}
            final swapchain extent: {}x{}, present mode: {:?}",
            caps.current_extent.width,
            caps.current_extent.height,
            caps.min_image_extent.width,
            caps.min_image_extent.height,
            caps.max_image_extent.width,
            caps.max_image_extent.height,
            info.width,
            info.height,
            extent.width,
            extent.height,
            present_mode
        );

        let old_swapchain = match info.old_swapchain {
            Some(old) => self.swapchains.with(old, |swapchain| swapchain.handle)?,
            None => vk::SwapchainKHR::null(),
        };
        let swapchain_ci = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(swapchain_image_count(&caps))
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            // TRANSFER_DST 用于 Nsight 分析
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .clipped(true)
            .old_swapchain(old_swapchain);
        let handle = unsafe { swapchain_loader.create_swapchain(&swapchain_ci, None) }.map_err(vk_error)?;
        self.set_debug_name(handle, "main");

        let images = match unsafe { swapchain_loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(handle, None) };
                return Err(vk_error(e));
            }
        };
        let textures = images
            .iter()
            .map(|image| {
                self.textures.insert(VulkanTexture {
                    handle: *image,
                    allocation: None,
                    format,
                })
            })
            .collect_vec();

        Ok(VulkanSwapchain {
            handle,
            surface,
            desc: SwapchainDesc {
                format,
                width: extent.width,
                height: extent.height,
                image_count: textures.len() as u32,
            },
            textures,
        })
    }

    pub(crate) fn destroy_vk_swapchain(&self, swapchain: RawSwapchainHandle) {
        let Some(swapchain) = self.swapchains.remove(swapchain) else {
            return;
        };
        for texture in &swapchain.textures {
            self.textures.remove(*texture);
        }
        if let Ok(swapchain_loader) = self.swapchain_loader() {
            unsafe { swapchain_loader.destroy_swapchain(swapchain.handle, None) };
        }
        unsafe { self.surface_loader.destroy_surface(swapchain.surface, None) };
        log::info!("swapchain destroyed");
    }

    pub(crate) fn acquire_vk_swapchain_image(
        &self,
        swapchain: RawSwapchainHandle,
        signal_semaphore: Option<RawSemaphoreHandle>,
        timeout_ns: u64,
    ) -> (GfxResult, u32) {
        let Ok(swapchain_loader) = self.swapchain_loader() else {
            return (GfxResult::ErrorInitializationFailed, 0);
        };
        let Ok(handle) = self.swapchains.with(swapchain, |swapchain| swapchain.handle) else {
            return (GfxResult::ErrorInvalidParameter, 0);
        };
        let semaphore = match signal_semaphore.map(|semaphore| self.semaphores.get(semaphore)).transpose() {
            Ok(semaphore) => semaphore.unwrap_or_default(),
            Err(_) => return (GfxResult::ErrorInvalidParameter, 0),
        };

        match unsafe { swapchain_loader.acquire_next_image(handle, timeout_ns, semaphore, vk::Fence::null()) } {
            Ok((image_index, is_suboptimal)) => {
                if is_suboptimal {
                    log::warn!("swapchain acquire image index {} is not optimal", image_index);
                }
                (GfxResult::Success, image_index)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("swapchain is out of date when acquire next image");
                (GfxResult::ErrorUnknown, 0)
            }
            Err(e) => (conv::gfx_result(e), 0),
        }
    }

    pub(crate) fn present_vk(
        &self,
        queue: QueueType,
        swapchain: RawSwapchainHandle,
        image_index: u32,
        wait_semaphores: &[RawSemaphoreHandle],
    ) -> GfxResult {
        let Ok(swapchain_loader) = self.swapchain_loader() else {
            return GfxResult::ErrorInitializationFailed;
        };
        let Ok(handle) = self.swapchains.with(swapchain, |swapchain| swapchain.handle) else {
            return GfxResult::ErrorInvalidParameter;
        };
        let Ok(wait_semaphores) =
            wait_semaphores.iter().map(|semaphore| self.semaphores.get(*semaphore)).collect::<Result<Vec<_>, _>>()
        else {
            return GfxResult::ErrorInvalidParameter;
        };

        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .image_indices(&image_indices)
            .swapchains(std::slice::from_ref(&handle));
        let queue = self.queue(queue).handle.lock();
        match unsafe { swapchain_loader.queue_present(*queue, &present_info) } {
            Ok(is_suboptimal) => {
                if is_suboptimal {
                    log::warn!("swapchain present image index {} is not optimal", image_index);
                }
                GfxResult::Success
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("swapchain is out of date when present image");
                GfxResult::ErrorUnknown
            }
            Err(e) => conv::gfx_result(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            min_image_count: min_count,
            max_image_count: max_count,
            ..Default::default()
        }
    }

    #[test]
    fn test_extent_follows_surface_unless_undefined() {
        assert_eq!(
            swapchain_extent(&caps((1280, 720), 2, 0), 800, 600),
            vk::Extent2D {
                width: 1280,
                height: 720
            }
        );
        assert_eq!(
            swapchain_extent(&caps((u32::MAX, u32::MAX), 2, 0), 8000, 600),
            vk::Extent2D {
                width: 4096,
                height: 600
            }
        );
    }

    #[test]
    fn test_image_count() {
        assert_eq!(swapchain_image_count(&caps((1, 1), 2, 0)), 3);
        assert_eq!(swapchain_image_count(&caps((1, 1), 2, 2)), 2);
    }

    #[test]
    fn test_surface_format_choice() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::A2B10G10R10_UNORM_PACK32,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(choose_surface_format(&formats, Format::B8G8R8A8Srgb).map(|(_, f)| f), Some(Format::B8G8R8A8Srgb));
        assert_eq!(choose_surface_format(&formats, Format::R8G8B8A8Unorm).map(|(_, f)| f), Some(Format::B8G8R8A8Unorm));
        assert!(choose_surface_format(&formats[..1], Format::B8G8R8A8Srgb).is_none());
    }

    #[test]
    fn test_present_mode() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::FIFO], false), vk::PresentModeKHR::FIFO);
    }
}
