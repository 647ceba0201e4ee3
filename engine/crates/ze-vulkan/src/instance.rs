use std::ffi::{CStr, CString, c_char};

use ash::vk;
use itertools::Itertools;
use raw_window_handle::RawDisplayHandle;
use ze_gfx::GfxError;

use crate::{conv::vk_error, debug_messenger::VulkanDebugMessenger};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan instance 以及可选的 debug messenger
pub struct VulkanInstance {
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) debug_messenger: Option<VulkanDebugMessenger>,
    /// 创建时传入了 display handle，surface extension 已开启
    pub(crate) surface_enabled: bool,
}

// new & init
impl VulkanInstance {
    /// 设置所需的 layers 和 extensions，创建 vk instance
    ///
    /// 传入 display handle 时开启对应平台的 surface extension。
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display_handle: Option<RawDisplayHandle>,
    ) -> Result<Self, GfxError> {
        let _span = tracy_client::span!("VulkanInstance::new");

        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GfxError::InitializationFailed(format!("failed to load vulkan: {}", e)))?;

        let app_name = CString::new(app_name).map_err(|e| GfxError::invalid_parameter(e.to_string()))?;
        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_2)
            .application_name(app_name.as_c_str())
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"ze")
            .engine_version(vk::make_api_version(0, 1, 0, 0));

        let mut required_exts = Vec::new();
        if let Some(display_handle) = display_handle {
            let surface_exts = ash_window::enumerate_required_extensions(display_handle).map_err(vk_error)?;
            required_exts.extend(surface_exts.iter().map(|ext| unsafe { CStr::from_ptr(*ext) }));
        }
        if enable_validation {
            // debug messenger 与 object debug name
            required_exts.push(ash::ext::debug_utils::NAME);
        }
        let enabled_exts = Self::get_extensions(&entry, &required_exts)?;
        let enabled_layers = if enable_validation { Self::get_layers(&entry)? } else { Vec::new() };

        let mut instance_ci = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&enabled_exts)
            .enabled_layer_names(&enabled_layers);
        let mut debug_utils_messenger_ci = VulkanDebugMessenger::messenger_create_info();
        if enable_validation {
            instance_ci = instance_ci.push_next(&mut debug_utils_messenger_ci);
        }

        let instance = unsafe { entry.create_instance(&instance_ci, None) }.map_err(vk_error)?;
        let debug_messenger = if enable_validation {
            match VulkanDebugMessenger::new(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            debug_messenger,
            surface_enabled: display_handle.is_some(),
        })
    }

    /// instance 所需的且受支持的 extension
    fn get_extensions(entry: &ash::Entry, required: &[&'static CStr]) -> Result<Vec<*const c_char>, GfxError> {
        let all_ext_props = unsafe { entry.enumerate_instance_extension_properties(None) }.map_err(vk_error)?;
        let mut enabled = Vec::new();
        for ext in required.iter().unique() {
            let supported = all_ext_props.iter().any(|props| props.extension_name_as_c_str() == Ok(*ext));
            if !supported {
                return Err(GfxError::InitializationFailed(format!("instance extension {:?} is missing", ext)));
            }
            enabled.push(ext.as_ptr());
        }

        log::info!("instance extensions: {}", required.iter().map(|ext| format!("\n\t{:?}", ext)).join(""));
        Ok(enabled)
    }

    /// 验证层缺失时只给出警告
    fn get_layers(entry: &ash::Entry) -> Result<Vec<*const c_char>, GfxError> {
        let all_layer_props = unsafe { entry.enumerate_instance_layer_properties() }.map_err(vk_error)?;
        let supported = all_layer_props.iter().any(|props| props.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
        if supported {
            log::info!("instance layers: \n\t{:?}", VALIDATION_LAYER);
            Ok(vec![VALIDATION_LAYER.as_ptr()])
        } else {
            log::warn!("validation requested but {:?} is not installed", VALIDATION_LAYER);
            Ok(Vec::new())
        }
    }
}

// getters
impl VulkanInstance {
    #[inline]
    pub fn ash_instance(&self) -> &ash::Instance {
        &self.instance
    }

    #[inline]
    pub fn validation_enabled(&self) -> bool {
        self.debug_messenger.is_some()
    }
}

// destroy
impl VulkanInstance {
    /// 所有 instance 级别的子对象都必须已经销毁
    pub fn destroy(&mut self) {
        log::info!("destroying vulkan instance");
        if let Some(messenger) = &mut self.debug_messenger {
            messenger.destroy();
        }
        unsafe { self.instance.destroy_instance(None) };
    }
}

/// 表示一张物理显卡
pub struct PhysicalDevice {
    pub handle: vk::PhysicalDevice,
    pub props: vk::PhysicalDeviceProperties,
    pub queue_family_properties: Vec<vk::QueueFamilyProperties>,
}

impl PhysicalDevice {
    /// 优先选择独立显卡，如果没有则选择第一个可用的显卡
    pub fn pick(instance: &ash::Instance) -> Result<Self, GfxError> {
        let pdevices = unsafe { instance.enumerate_physical_devices() }.map_err(vk_error)?;
        pdevices
            .into_iter()
            .map(|pdevice| Self::new(instance, pdevice))
            .filter(|pdevice| pdevice.props.api_version >= vk::API_VERSION_1_2)
            .find_or_first(PhysicalDevice::is_discrete_gpu)
            .inspect(|pdevice| log::info!("gpu selected: {}", pdevice.name()))
            .ok_or_else(|| GfxError::InitializationFailed("no gpu supports vulkan 1.2".to_string()))
    }

    fn new(instance: &ash::Instance, handle: vk::PhysicalDevice) -> Self {
        let props = unsafe { instance.get_physical_device_properties(handle) };
        let queue_family_properties = unsafe { instance.get_physical_device_queue_family_properties(handle) };
        let pdevice = Self {
            handle,
            props,
            queue_family_properties,
        };
        log::info!("found gpu: {}", pdevice.name());
        pdevice
    }

    #[inline]
    pub fn is_discrete_gpu(&self) -> bool {
        self.props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }

    pub fn name(&self) -> String {
        self.props
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed gpu>".to_string())
    }

    /// 找到满足条件的 queue family；优先不含 `avoid` 能力的专用 family
    pub fn find_queue_family_index(&self, flags: vk::QueueFlags, avoid: vk::QueueFlags) -> Option<u32> {
        let candidates = self
            .queue_family_properties
            .iter()
            .enumerate()
            .filter(|(_, props)| props.queue_flags.contains(flags))
            .collect_vec();
        candidates
            .iter()
            .find(|(_, props)| !props.queue_flags.intersects(avoid))
            .or_else(|| candidates.first())
            .map(|(index, _)| *index as u32)
    }
}
