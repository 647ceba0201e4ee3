//! ze 工具集
//!
//! 提供日志初始化、TOML 配置加载等在各个 crate 之间共享的工具。

pub mod config;
pub mod init_log;
