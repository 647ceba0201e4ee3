use serde::{Deserialize, Serialize};

/// Device 的配置
///
/// 可以从 TOML 加载，缺失的字段使用默认值。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// 后端名字，见 `BackendRegistry`
    pub backend: String,
    pub app_name: String,
    /// 同时在 GPU 上执行的帧数
    pub max_frames_in_flight: usize,
    /// 每个 bindless pool 的容量
    pub max_descriptors_per_binding: u32,
    /// 开启验证层；释放的 bindless 槽位会被写回 dummy 资源
    pub debug_validation: bool,
    pub fence_timeout_ns: u64,
    /// 每帧临时 descriptor set 的上限
    pub max_transient_descriptor_sets: u32,
    /// 渲染图缓存的物理资源，连续多少帧未使用后回收
    pub physical_resource_max_idle_frames: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            backend: "vulkangfx".to_string(),
            app_name: "ze".to_string(),
            max_frames_in_flight: 3,
            max_descriptors_per_binding: 1024,
            debug_validation: cfg!(debug_assertions),
            fence_timeout_ns: u64::MAX,
            max_transient_descriptor_sets: 1024,
            physical_resource_max_idle_frames: 8,
        }
    }
}

impl DeviceSettings {
    pub const MAX_FRAMES_IN_FLIGHT_LIMIT: usize = 8;

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// 将越界的字段收回合法范围
    pub fn sanitized(mut self) -> Self {
        let clamped = self.max_frames_in_flight.clamp(1, Self::MAX_FRAMES_IN_FLIGHT_LIMIT);
        if clamped != self.max_frames_in_flight {
            log::warn!("max_frames_in_flight {} clamped to {}", self.max_frames_in_flight, clamped);
            self.max_frames_in_flight = clamped;
        }
        if self.max_descriptors_per_binding == 0 {
            log::warn!("max_descriptors_per_binding is 0, using 1024");
            self.max_descriptors_per_binding = 1024;
        }
        self.max_transient_descriptor_sets = self.max_transient_descriptor_sets.max(1);
        self
    }

    pub fn headless() -> Self {
        Self {
            backend: "headless".to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings = DeviceSettings::from_toml_str(
            r#"
            backend = "headless"
            max_frames_in_flight = 2
            "#,
        )
        .unwrap();
        assert_eq!(settings.backend, "headless");
        assert_eq!(settings.max_frames_in_flight, 2);
        assert_eq!(settings.max_descriptors_per_binding, 1024);
    }

    #[test]
    fn test_sanitize_clamps_frames_in_flight() {
        let settings = DeviceSettings {
            max_frames_in_flight: 0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(settings.max_frames_in_flight, 1);

        let settings = DeviceSettings {
            max_frames_in_flight: 100,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(settings.max_frames_in_flight, DeviceSettings::MAX_FRAMES_IN_FLIGHT_LIMIT);
    }
}
