use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use ze_device::DeviceSettings;

/// ze-app 的配置，对应工作目录下的 `ze.toml`
///
/// 没有配置文件时使用 headless 后端，shader 从内置的定义加载。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceSettings,
    /// 运行的帧数
    pub frames: u32,
    pub width: u32,
    pub height: u32,
    /// shader 定义与源码所在的目录；为空时使用内置的 shader
    pub shader_root: Option<PathBuf>,
    /// shader 编译线程数
    pub shader_threads: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: DeviceSettings {
                app_name: "ze-app".to_string(),
                ..DeviceSettings::headless()
            },
            frames: 5,
            width: 1280,
            height: 720,
            shader_root: None,
            shader_threads: 2,
        }
    }
}

impl AppConfig {
    pub const PATH: &'static str = "ze.toml";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_headless() {
        let config = AppConfig::default();
        assert_eq!(config.device.backend, "headless");
        assert!(config.shader_root.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config: AppConfig = toml_from_str(
            r#"
            frames = 2

            [device]
            backend = "vulkangfx"
            max_frames_in_flight = 2
            "#,
        );
        assert_eq!(config.frames, 2);
        assert_eq!(config.width, 1280);
        assert_eq!(config.device.backend, "vulkangfx");
        assert_eq!(config.device.max_frames_in_flight, 2);
        assert_eq!(config.device.app_name, "ze");
    }

    fn toml_from_str(content: &str) -> AppConfig {
        let dir = std::env::temp_dir().join(format!("ze-app-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(AppConfig::PATH);
        std::fs::write(&path, content).unwrap();
        let config = ze_crate_tools::config::load_toml_config(&path).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
        config
    }
}
