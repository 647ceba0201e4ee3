use std::ffi::CStr;

use ash::vk;
use ze_gfx::GfxError;

use crate::conv::vk_error;

/// 把验证层的消息转发到 log
pub struct VulkanDebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

// new & init
impl VulkanDebugMessenger {
    pub fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self, GfxError> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let create_info = Self::messenger_create_info();
        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }.map_err(vk_error)?;

        Ok(Self { loader, messenger })
    }

    /// 同时用于 instance 的创建过程，覆盖 create_instance/destroy_instance 期间的消息
    pub fn messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
        vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vk_debug_callback))
    }
}

// destroy
impl VulkanDebugMessenger {
    /// 必须在 instance 销毁之前调用
    pub fn destroy(&mut self) {
        if self.messenger != vk::DebugUtilsMessengerEXT::null() {
            log::info!("destroying vulkan debug messenger");
            unsafe { self.loader.destroy_debug_utils_messenger(self.messenger, None) };
            self.messenger = vk::DebugUtilsMessengerEXT::null();
        }
    }
}

/// 验证层的消息是 json 时，把 MainMessage 单独取出来输出，其中含有换行
fn format_message(message_type: vk::DebugUtilsMessageTypeFlagsEXT, msg: &str) -> String {
    let mut json_value = serde_json::from_str::<serde_json::Value>(msg).ok();
    let json_obj = json_value.as_mut().and_then(|v| v.as_object_mut());
    match json_obj {
        Some(obj) => {
            let main_msg = obj.remove("MainMessage");
            let main_msg = main_msg.as_ref().and_then(|v| v.as_str()).unwrap_or_default();
            let rest = serde_json::to_string_pretty(obj).unwrap_or_default();
            format!("[{:?}]\n{}\n{}", message_type, rest, main_msg)
        }
        None => format!("[{:?}] {}", message_type, msg),
    }
}

/// debug messenger 的回调函数
///
/// # Safety
/// 由 Vulkan loader 调用，`p_callback_data` 在回调期间有效
unsafe extern "system" fn vk_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    let msg = if p_callback_data.is_null() || unsafe { (*p_callback_data).p_message.is_null() } {
        std::borrow::Cow::from("")
    } else {
        unsafe { CStr::from_ptr((*p_callback_data).p_message).to_string_lossy() }
    };
    let msg = format_message(message_type, msg.as_ref());

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("{}", msg),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("{}", msg),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("{}", msg),
        _ => log::debug!("{}", msg),
    };

    // 只有 layer developer 才需要返回 True
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_main_message_extracted() {
        let msg = format_message(
            vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            r#"{"MainMessage": "line one\nline two", "MessageID": 7}"#,
        );
        assert!(msg.ends_with("line one\nline two"));
        assert!(msg.contains("\"MessageID\": 7"));
        assert!(!msg.contains("MainMessage"));
    }

    #[test]
    fn test_plain_message_kept() {
        let msg = format_message(vk::DebugUtilsMessageTypeFlagsEXT::GENERAL, "loader message");
        assert!(msg.ends_with("loader message"));
    }
}
