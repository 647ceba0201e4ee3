use std::{fs, path::Path};

use anyhow::Context;
use serde::{Serialize, de::DeserializeOwned};

/// 从 TOML 文件加载配置
pub fn load_toml_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).with_context(|| format!("读取配置文件失败: {:?}", path))?;
    let config = toml::from_str(&content).with_context(|| format!("解析 TOML 配置失败: {:?}", path))?;

    log::info!("config loaded: {:?}", path);
    Ok(config)
}

/// 文件不存在时返回默认值，其余错误照常返回
pub fn load_toml_config_or_default<T: DeserializeOwned + Default>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    if !path.exists() {
        log::warn!("config file {:?} not found, using defaults", path);
        return Ok(T::default());
    }
    load_toml_config(path)
}

/// 保存配置到 TOML 文件
pub fn save_toml_config<T: Serialize>(config: &T, path: impl AsRef<Path>) -> anyhow::Result<()> {
    let path = path.as_ref();
    let content = toml::to_string_pretty(config).context("序列化配置失败")?;
    fs::write(path, content).with_context(|| format!("写入配置文件失败: {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct TestConfig {
        name: String,
        #[serde(default)]
        count: u32,
    }

    #[test]
    fn test_save_then_load() {
        let dir = std::env::temp_dir().join(format!("ze-crate-tools-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.toml");

        let config = TestConfig {
            name: "ze".to_string(),
            count: 3,
        };
        save_toml_config(&config, &path).unwrap();
        let loaded: TestConfig = load_toml_config(&path).unwrap();
        assert_eq!(loaded, config);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_uses_default() {
        let loaded: TestConfig = load_toml_config_or_default("/definitely/not/here.toml").unwrap();
        assert_eq!(loaded, TestConfig::default());
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(load_toml_config::<TestConfig>("/definitely/not/here.toml").is_err());
    }
}
