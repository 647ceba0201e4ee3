//! 不依赖窗口运行若干帧：创建设备、加载 shader、每帧构建并执行渲染图
//!
//! 配置从工作目录下的 `ze.toml` 读取，文件不存在时使用 headless 后端。

mod app;
mod config;

use anyhow::Context;
use app::{HeadlessApp, backend_registry};
use config::AppConfig;

fn main() -> anyhow::Result<()> {
    ze_crate_tools::init_log::init_log();

    let config: AppConfig = ze_crate_tools::config::load_toml_config_or_default(AppConfig::PATH)?;
    let registry = backend_registry();
    log::info!("available backends: {}", registry.names().collect::<Vec<_>>().join(", "));

    let mut app = HeadlessApp::new(&registry, config).context("failed to start")?;
    app.run()?;
    app.shutdown()
}
