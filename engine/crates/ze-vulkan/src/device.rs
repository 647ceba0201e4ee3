use std::{collections::HashMap, ffi::CString, mem::ManuallyDrop};

use ash::vk;
use itertools::Itertools;
use parking_lot::Mutex;
use ze_gfx::{
    Format, GfxError, SwapchainDesc,
    create_info::{DeviceCreateInfo, RenderPassCreateInfo},
    handle::*,
    types::QueueType,
};

use crate::{
    conv::vk_error,
    instance::{PhysicalDevice, VulkanInstance},
    objects::ObjectTable,
};

pub(crate) struct VulkanBuffer {
    pub handle: vk::Buffer,
    pub allocation: vk_mem::Allocation,
}

pub(crate) struct VulkanTexture {
    pub handle: vk::Image,
    /// 交换链的 image 没有 allocation，也不由后端销毁
    pub allocation: Option<vk_mem::Allocation>,
    pub format: Format,
}

#[derive(Clone, Copy)]
pub(crate) struct VulkanTextureView {
    pub handle: vk::ImageView,
}

pub(crate) struct VulkanPipelineLayout {
    pub handle: vk::PipelineLayout,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
}

#[derive(Clone, Copy)]
pub(crate) struct VulkanCommandPool {
    pub handle: vk::CommandPool,
}

#[derive(Clone, Copy)]
pub(crate) struct VulkanCommandList {
    pub handle: vk::CommandBuffer,
    pub pool: RawCommandPoolHandle,
}

#[derive(Clone, Copy)]
pub(crate) struct VulkanDescriptorSet {
    pub handle: vk::DescriptorSet,
    pub pool: RawDescriptorPoolHandle,
}

pub(crate) struct VulkanSwapchain {
    pub handle: vk::SwapchainKHR,
    pub surface: vk::SurfaceKHR,
    pub textures: Vec<RawTextureHandle>,
    pub desc: SwapchainDesc,
}

/// framebuffer 由后端按 render pass 与 attachment 缓存
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FramebufferKey {
    pub render_pass: RawRenderPassHandle,
    pub views: Vec<RawTextureViewHandle>,
    pub width: u32,
    pub height: u32,
}

pub(crate) struct VulkanQueue {
    pub family: u32,
    /// vkQueueSubmit 与 vkQueuePresentKHR 需要外部同步
    pub handle: Mutex<vk::Queue>,
}

/// Vulkan 实现的后端设备
pub struct VulkanBackendDevice {
    pub(crate) instance: VulkanInstance,
    pub(crate) pdevice: PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) allocator: ManuallyDrop<vk_mem::Allocator>,

    pub(crate) surface_loader: ash::khr::surface::Instance,
    /// GPU 不支持 VK_KHR_swapchain 时为 None
    pub(crate) swapchain_loader: Option<ash::khr::swapchain::Device>,
    pub(crate) debug_utils: Option<ash::ext::debug_utils::Device>,
    pub(crate) anisotropy_supported: bool,

    pub(crate) queues: Vec<VulkanQueue>,
    /// QueueType 对应的 `queues` 下标
    pub(crate) queue_slots: [usize; 3],

    pub(crate) buffers: ObjectTable<BufferKind, VulkanBuffer>,
    pub(crate) textures: ObjectTable<TextureKind, VulkanTexture>,
    pub(crate) texture_views: ObjectTable<TextureViewKind, VulkanTextureView>,
    pub(crate) samplers: ObjectTable<SamplerKind, vk::Sampler>,
    pub(crate) shaders: ObjectTable<ShaderKind, vk::ShaderModule>,
    pub(crate) render_passes: ObjectTable<RenderPassKind, (vk::RenderPass, RenderPassCreateInfo)>,
    pub(crate) pipeline_layouts: ObjectTable<PipelineLayoutKind, VulkanPipelineLayout>,
    pub(crate) pipelines: ObjectTable<PipelineKind, vk::Pipeline>,
    pub(crate) descriptor_pools: ObjectTable<DescriptorPoolKind, vk::DescriptorPool>,
    pub(crate) descriptor_sets: ObjectTable<DescriptorSetKind, VulkanDescriptorSet>,
    pub(crate) command_pools: ObjectTable<CommandPoolKind, VulkanCommandPool>,
    pub(crate) command_lists: ObjectTable<CommandListKind, VulkanCommandList>,
    pub(crate) fences: ObjectTable<FenceKind, vk::Fence>,
    pub(crate) semaphores: ObjectTable<SemaphoreKind, vk::Semaphore>,
    pub(crate) swapchains: ObjectTable<SwapchainKind, VulkanSwapchain>,

    pub(crate) framebuffers: Mutex<HashMap<FramebufferKey, vk::Framebuffer>>,
}

// new & init
impl VulkanBackendDevice {
    pub fn new(info: &DeviceCreateInfo) -> Result<Self, GfxError> {
        let _span = tracy_client::span!("VulkanBackendDevice::new");

        let mut instance = VulkanInstance::new(&info.app_name, info.enable_validation, info.display_handle)?;
        match Self::with_instance(&instance) {
            Ok(parts) => Ok(Self::assemble(instance, parts)),
            Err(e) => {
                instance.destroy();
                Err(e)
            }
        }
    }

    fn with_instance(instance: &VulkanInstance) -> Result<DeviceParts, GfxError> {
        let ash_instance = instance.ash_instance();
        let pdevice = PhysicalDevice::pick(ash_instance)?;

        // 每种 QueueType 选择一个 family，相同的 family 共用一个 queue
        let gfx_family = pdevice
            .find_queue_family_index(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, vk::QueueFlags::empty())
            .ok_or_else(|| GfxError::InitializationFailed("no graphics queue family".to_string()))?;
        let compute_family =
            pdevice.find_queue_family_index(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS).unwrap_or(gfx_family);
        let transfer_family = pdevice
            .find_queue_family_index(vk::QueueFlags::TRANSFER, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            .unwrap_or(gfx_family);
        let families = [gfx_family, compute_family, transfer_family].into_iter().unique().collect_vec();
        log::info!(
            "queue families: gfx {}, compute {}, transfer {}",
            gfx_family,
            compute_family,
            transfer_family
        );

        let priorities = [1.0f32];
        let queue_cis = families
            .iter()
            .map(|family| vk::DeviceQueueCreateInfo::default().queue_family_index(*family).queue_priorities(&priorities))
            .collect_vec();

        let device_exts = unsafe { ash_instance.enumerate_device_extension_properties(pdevice.handle) }
            .map_err(vk_error)?;
        let swapchain_supported =
            device_exts.iter().any(|ext| ext.extension_name_as_c_str() == Ok(ash::khr::swapchain::NAME));
        let enabled_exts = if swapchain_supported {
            vec![ash::khr::swapchain::NAME.as_ptr()]
        } else {
            log::warn!("{} does not support VK_KHR_swapchain", pdevice.name());
            Vec::new()
        };

        let supported_features = unsafe { ash_instance.get_physical_device_features(pdevice.handle) };
        let anisotropy_supported = supported_features.sampler_anisotropy == vk::TRUE;
        let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(anisotropy_supported);
        // bindless 所需的 descriptor indexing
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_update_unused_while_pending(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .descriptor_binding_storage_buffer_update_after_bind(true);

        let device_ci = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_cis)
            .enabled_extension_names(&enabled_exts)
            .enabled_features(&features)
            .push_next(&mut features12);
        let device = unsafe { ash_instance.create_device(pdevice.handle, &device_ci, None) }.map_err(vk_error)?;

        let mut vma_ci = vk_mem::AllocatorCreateInfo::new(ash_instance, &device, pdevice.handle);
        vma_ci.vulkan_api_version = vk::API_VERSION_1_2;
        let allocator = match unsafe { vk_mem::Allocator::new(vma_ci) } {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(vk_error(e));
            }
        };

        let queues = families
            .iter()
            .map(|family| VulkanQueue {
                family: *family,
                handle: Mutex::new(unsafe { device.get_device_queue(*family, 0) }),
            })
            .collect_vec();
        let slot_of = |family: u32| families.iter().position(|f| *f == family).unwrap_or(0);
        let queue_slots = [slot_of(gfx_family), slot_of(compute_family), slot_of(transfer_family)];

        let swapchain_loader = swapchain_supported.then(|| ash::khr::swapchain::Device::new(ash_instance, &device));
        let debug_utils =
            instance.validation_enabled().then(|| ash::ext::debug_utils::Device::new(ash_instance, &device));

        Ok(DeviceParts {
            pdevice,
            device,
            allocator,
            swapchain_loader,
            debug_utils,
            anisotropy_supported,
            queues,
            queue_slots,
        })
    }

    fn assemble(instance: VulkanInstance, parts: DeviceParts) -> Self {
        let surface_loader = ash::khr::surface::Instance::new(&instance.entry, &instance.instance);
        log::info!("vulkan device created on {}", parts.pdevice.name());
        Self {
            surface_loader,
            instance,
            pdevice: parts.pdevice,
            device: parts.device,
            allocator: ManuallyDrop::new(parts.allocator),
            swapchain_loader: parts.swapchain_loader,
            debug_utils: parts.debug_utils,
            anisotropy_supported: parts.anisotropy_supported,
            queues: parts.queues,
            queue_slots: parts.queue_slots,

            buffers: ObjectTable::default(),
            textures: ObjectTable::default(),
            texture_views: ObjectTable::default(),
            samplers: ObjectTable::default(),
            shaders: ObjectTable::default(),
            render_passes: ObjectTable::default(),
            pipeline_layouts: ObjectTable::default(),
            pipelines: ObjectTable::default(),
            descriptor_pools: ObjectTable::default(),
            descriptor_sets: ObjectTable::default(),
            command_pools: ObjectTable::default(),
            command_lists: ObjectTable::default(),
            fences: ObjectTable::default(),
            semaphores: ObjectTable::default(),
            swapchains: ObjectTable::default(),

            framebuffers: Mutex::new(HashMap::new()),
        }
    }
}

/// instance 之后创建的部分，失败时由 `new` 负责销毁 instance
struct DeviceParts {
    pdevice: PhysicalDevice,
    device: ash::Device,
    allocator: vk_mem::Allocator,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    anisotropy_supported: bool,
    queues: Vec<VulkanQueue>,
    queue_slots: [usize; 3],
}

// getters
impl VulkanBackendDevice {
    #[inline]
    pub fn gpu_name(&self) -> String {
        self.pdevice.name()
    }

    #[inline]
    pub(crate) fn queue(&self, queue: QueueType) -> &VulkanQueue {
        let slot = match queue {
            QueueType::Gfx => self.queue_slots[0],
            QueueType::Compute => self.queue_slots[1],
            QueueType::Transfer => self.queue_slots[2],
        };
        &self.queues[slot]
    }

    pub(crate) fn swapchain_loader(&self) -> Result<&ash::khr::swapchain::Device, GfxError> {
        self.swapchain_loader
            .as_ref()
            .ok_or_else(|| GfxError::InitializationFailed("VK_KHR_swapchain is not enabled".to_string()))
    }
}

// tools
impl VulkanBackendDevice {
    /// 只有开启验证层时才会设置
    pub(crate) fn set_debug_name<T: vk::Handle + Copy>(&self, handle: T, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        if name.is_empty() {
            return;
        }
        let Ok(name) = CString::new(name) else {
            log::warn!("debug name {:?} contains nul", name);
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT::default().object_name(name.as_c_str()).object_handle(handle);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&name_info) } {
            log::warn!("failed to set debug name {:?}: {:?}", name, e);
        }
    }

    /// 引用了指定 view 或 render pass 的 framebuffer 全部销毁
    pub(crate) fn evict_framebuffers(&self, pred: impl Fn(&FramebufferKey) -> bool) {
        self.framebuffers.lock().retain(|key, framebuffer| {
            if pred(key) {
                unsafe { self.device.destroy_framebuffer(*framebuffer, None) };
                false
            } else {
                true
            }
        });
    }
}

// destroy
impl Drop for VulkanBackendDevice {
    fn drop(&mut self) {
        let _span = tracy_client::span!("VulkanBackendDevice::drop");
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::error!("device_wait_idle failed while destroying vulkan device: {:?}", e);
        }

        self.evict_framebuffers(|_| true);
        let leaked = [
            ("buffer", self.buffers.len()),
            ("texture", self.textures.len()),
            ("texture view", self.texture_views.len()),
            ("pipeline", self.pipelines.len()),
            ("command pool", self.command_pools.len()),
            ("swapchain", self.swapchains.len()),
        ];
        for (what, count) in leaked {
            if count > 0 {
                log::warn!("vulkan device destroyed with {} live {} objects", count, what);
            }
        }

        log::info!("destroying vulkan device");
        unsafe {
            // vma 必须在 device 之前销毁
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        self.instance.destroy();
    }
}
