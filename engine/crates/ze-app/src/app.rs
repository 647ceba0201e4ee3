use std::sync::Arc;

use anyhow::Context;
use ze_device::{
    Device, DeviceError, SamplerHandle, TextureCreateInfo, TextureHandle, TextureViewCreateInfo, TextureViewHandle,
};
use ze_gfx::{
    BackendRegistry, DeviceResourceType, Format,
    commands::{Rect2D, Viewport},
    create_info::SamplerCreateInfo,
    headless::HeadlessBackend,
    types::{QueueType, TextureUsage},
};
use ze_render_graph::{AttachmentInfo, PassContext, PhysicalResourceRegistry, RenderGraph};
use ze_shader::{
    FileSystem, JobSystem, MemoryFileSystem, NativeFileSystem, PassthroughShaderCompiler, ShaderError, ShaderInstance,
    ShaderManager,
};
use ze_vulkan::VulkanBackend;

use crate::config::AppConfig;

const FULLSCREEN_SHADER: &str = "fullscreen";
const SCENE_FORMAT: Format = Format::R16G16B16A16Sfloat;
const BACKBUFFER_FORMAT: Format = Format::R8G8B8A8Unorm;

/// 注册所有内置后端
pub fn backend_registry() -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(HeadlessBackend));
    registry.register(Arc::new(VulkanBackend));
    registry
}

/// 内置的 shader，`shader_root` 未配置时使用
fn builtin_shaders() -> MemoryFileSystem {
    let fs = MemoryFileSystem::new();
    fs.insert("fullscreen.toml", include_str!("../shaders/fullscreen.toml"));
    fs.insert("fullscreen.vert.hlsl", include_str!("../shaders/fullscreen.vert.hlsl"));
    fs.insert("fullscreen.frag.hlsl", include_str!("../shaders/fullscreen.frag.hlsl"));
    fs
}

/// pass 的 execute 回调只能返回 DeviceError
fn into_device_error(e: ShaderError) -> DeviceError {
    match e {
        ShaderError::Device(e) => e,
        e => DeviceError::Backend(ze_gfx::GfxError::Unknown(e.to_string())),
    }
}

fn set_full_viewport(ctx: &mut PassContext<'_>) {
    let (width, height) = ctx.extent();
    ctx.device.cmd_set_viewport(ctx.cmd, &Viewport::new(width as f32, height as f32));
    ctx.device.cmd_set_scissor(ctx.cmd, &Rect2D::from_extent(width, height));
}

/// 不依赖窗口的帧循环：场景 pass 输出 HDR 颜色，tonemap pass 写入离屏的 backbuffer
pub struct HeadlessApp {
    config: AppConfig,

    shaders: ShaderManager,
    physical: PhysicalResourceRegistry,

    backbuffer: TextureHandle,
    backbuffer_view: TextureViewHandle,
    sampler: SamplerHandle,

    frames_rendered: u32,

    /// 最后销毁
    device: Device,
}

// new & init
impl HeadlessApp {
    pub fn new(registry: &BackendRegistry, config: AppConfig) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("HeadlessApp::new");
        let device = Device::new(registry, config.device.clone(), None)
            .with_context(|| format!("failed to create device with backend {}", config.device.backend))?;

        let file_system: Arc<dyn FileSystem> = match &config.shader_root {
            Some(root) => Arc::new(NativeFileSystem::new(root)),
            None => Arc::new(builtin_shaders()),
        };
        let jobs = JobSystem::new(config.shader_threads).context("failed to create shader job system")?;
        let shaders = ShaderManager::new(file_system, Arc::new(PassthroughShaderCompiler), Arc::new(jobs));

        let backbuffer = device
            .create_texture(
                &TextureCreateInfo::new_2d(BACKBUFFER_FORMAT, config.width, config.height, TextureUsage::COLOR_ATTACHMENT)
                    .with_name("backbuffer"),
            )
            .context("failed to create backbuffer")?;
        let backbuffer_view = device
            .create_texture_view(&TextureViewCreateInfo::whole_2d(backbuffer))
            .context("failed to create backbuffer view")?;
        let sampler = device.get_or_create_sampler(&SamplerCreateInfo::default()).context("failed to create sampler")?;

        // 提前编译两个 permutation
        for tonemap in [false, true] {
            shaders.get_permutation(FULLSCREEN_SHADER, &[("TONEMAP", tonemap)])?.compile();
        }

        log::info!("headless app created: {}x{}, {} frames", config.width, config.height, config.frames);
        Ok(Self {
            config,
            shaders,
            physical: PhysicalResourceRegistry::new(),
            backbuffer,
            backbuffer_view,
            sampler,
            frames_rendered: 0,
            device,
        })
    }
}

// getters
impl HeadlessApp {
    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[inline]
    pub fn frames_rendered(&self) -> u32 {
        self.frames_rendered
    }

    #[inline]
    pub fn physical_attachment_count(&self) -> usize {
        self.physical.len()
    }
}

// update
impl HeadlessApp {
    pub fn run(&mut self) -> anyhow::Result<()> {
        for _ in 0..self.config.frames {
            self.render_frame()?;
        }
        Ok(())
    }

    pub fn render_frame(&mut self) -> anyhow::Result<()> {
        let _span = tracy_client::span!("HeadlessApp::render_frame");
        let device = &self.device;
        device.new_frame().context("new frame")?;

        let (width, height) = (self.config.width, self.config.height);
        let mut scene = ShaderInstance::new(device, self.shaders.get_permutation(FULLSCREEN_SHADER, &[])?)?;
        let mut tonemap =
            ShaderInstance::new(device, self.shaders.get_permutation(FULLSCREEN_SHADER, &[("TONEMAP", true)])?)?;
        let sampler_index = device
            .sampler_descriptor_index(self.sampler)
            .ok_or(DeviceError::invalid_handle(DeviceResourceType::Sampler))?;
        tonemap.set_parameter("scene_sampler", sampler_index)?;

        let mut cmd = device.allocate_command_list(QueueType::Gfx).context("allocate command list")?;
        {
            let mut graph = RenderGraph::new();
            graph.add_gfx_pass(
                "scene",
                |builder| {
                    let color = builder.add_color_output("scene_color", AttachmentInfo::new(SCENE_FORMAT));
                    builder.set_clear_color(color, [0.1, 0.1, 0.1, 1.0]);
                },
                move |ctx| {
                    set_full_viewport(ctx);
                    scene.bind(ctx.device, ctx.cmd).map_err(into_device_error)?;
                    ctx.device.cmd_draw(ctx.cmd, 3, 1, 0, 0)
                },
            );
            graph.add_gfx_pass(
                "tonemap",
                |builder| {
                    builder.add_attachment_input("scene_color");
                    builder.add_color_output("backbuffer", AttachmentInfo::new(BACKBUFFER_FORMAT));
                },
                move |ctx| {
                    let scene_view = ctx
                        .texture_view("scene_color")
                        .ok_or(DeviceError::invalid_handle(DeviceResourceType::TextureView))?;
                    tonemap.set_texture(ctx.device, "scene", scene_view).map_err(into_device_error)?;
                    set_full_viewport(ctx);
                    tonemap.bind(ctx.device, ctx.cmd).map_err(into_device_error)?;
                    ctx.device.cmd_draw(ctx.cmd, 3, 1, 0, 0)
                },
            );
            // 没有 pass 读取 debug_overlay，编译时会被剔除
            graph.add_gfx_pass(
                "debug_overlay",
                |builder| {
                    builder.add_color_output("debug_overlay", AttachmentInfo::new(BACKBUFFER_FORMAT));
                },
                |_| Ok(()),
            );
            graph.set_backbuffer_attachment("backbuffer", self.backbuffer_view, width, height);

            graph.compile(device, &mut self.physical).context("compile render graph")?;
            if self.frames_rendered == 0 {
                graph.print_execution_plan();
            }
            graph.execute(device, &mut cmd).context("execute render graph")?;
        }
        device.submit(cmd, &[], &[]).context("submit")?;

        let evicted = self.physical.evict_unused(
            device,
            device.frame_id(),
            device.settings().physical_resource_max_idle_frames,
        );
        if evicted > 0 {
            log::info!("{} evicted {} physical attachments", device.frame_name(), evicted);
        }
        self.frames_rendered += 1;
        Ok(())
    }
}

// destroy
impl HeadlessApp {
    /// 等待 GPU 完成后释放所有资源
    pub fn shutdown(mut self) -> anyhow::Result<()> {
        let _span = tracy_client::span!("HeadlessApp::shutdown");
        self.device.end_frame().context("end frame")?;
        self.device.wait_idle().context("wait idle")?;

        self.physical.clear(&self.device);
        self.shaders.destroy(&self.device);
        self.device.destroy_texture_view(self.backbuffer_view);
        self.device.destroy_texture(self.backbuffer);
        self.device.destroy_sampler(self.sampler);
        self.device.flush().context("flush retired resources")?;

        log::info!("headless app shut down after {} frames", self.frames_rendered);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(frames: u32) -> AppConfig {
        let mut config = AppConfig {
            frames,
            width: 320,
            height: 240,
            ..Default::default()
        };
        config.device.debug_validation = false;
        config
    }

    #[test]
    fn test_headless_frames() {
        ze_crate_tools::init_log::try_init_log();
        let mut app = HeadlessApp::new(&backend_registry(), small_config(4)).unwrap();
        app.run().unwrap();
        assert_eq!(app.frames_rendered(), 4);
        // scene_color 被缓存复用，debug_overlay 被剔除
        assert_eq!(app.physical_attachment_count(), 1);
        assert!(app.device().pipeline_cache_len() >= 2);
        app.shutdown().unwrap();
    }

    #[test]
    fn test_unknown_backend() {
        let mut config = small_config(1);
        config.device.backend = "metal".to_string();
        let error = HeadlessApp::new(&backend_registry(), config).err().unwrap();
        assert!(format!("{:#}", error).contains("metal"));
    }

    #[test]
    fn test_missing_shader_root() {
        let mut config = small_config(1);
        config.shader_root = Some(std::env::temp_dir().join("ze-app-missing-shaders"));
        assert!(HeadlessApp::new(&backend_registry(), config).is_err());
    }
}
