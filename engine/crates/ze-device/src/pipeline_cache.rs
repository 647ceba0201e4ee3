use std::collections::HashMap;

use parking_lot::Mutex;
use ze_gfx::{
    BackendDevice, GfxError,
    create_info::{ComputePipelineCreateInfo, GfxPipelineCreateInfo, RenderPassCreateInfo},
    handle::{RawPipelineHandle, RawRenderPassHandle, RawShaderHandle},
};

/// render pass 与 pipeline 的去重缓存
///
/// key 就是完整的 create info，按结构相等比较；相等的描述在 Device 生命周期内只创建一个后端对象。
/// shader 热重载时通过 [`PipelineCache::invalidate_shader`] 移除引用该 shader 的 pipeline。
#[derive(Default)]
pub struct PipelineCache {
    render_passes: Mutex<HashMap<RenderPassCreateInfo, RawRenderPassHandle>>,
    gfx_pipelines: Mutex<HashMap<GfxPipelineCreateInfo, RawPipelineHandle>>,
    compute_pipelines: Mutex<HashMap<ComputePipelineCreateInfo, RawPipelineHandle>>,
}

// getters
impl PipelineCache {
    #[inline]
    pub fn render_pass_count(&self) -> usize {
        self.render_passes.lock().len()
    }

    #[inline]
    pub fn pipeline_count(&self) -> usize {
        self.gfx_pipelines.lock().len() + self.compute_pipelines.lock().len()
    }
}

// tools
impl PipelineCache {
    pub fn get_or_create_render_pass(
        &self,
        backend: &dyn BackendDevice,
        info: &RenderPassCreateInfo,
    ) -> Result<RawRenderPassHandle, GfxError> {
        let mut render_passes = self.render_passes.lock();
        if let Some(render_pass) = render_passes.get(info) {
            return Ok(*render_pass);
        }

        let render_pass = backend.create_render_pass(info)?;
        log::debug!(
            "render pass {:?} created: {} color attachments, depth: {}",
            render_pass,
            info.color_attachments.len(),
            info.depth_stencil_attachment.is_some()
        );
        render_passes.insert(info.clone(), render_pass);
        Ok(render_pass)
    }

    pub fn get_or_create_gfx_pipeline(
        &self,
        backend: &dyn BackendDevice,
        info: &GfxPipelineCreateInfo,
    ) -> Result<RawPipelineHandle, GfxError> {
        let mut pipelines = self.gfx_pipelines.lock();
        if let Some(pipeline) = pipelines.get(info) {
            return Ok(*pipeline);
        }

        let _span = tracy_client::span!("PipelineCache::create_gfx_pipeline");
        let pipeline = backend.create_gfx_pipeline(info)?;
        log::debug!("gfx pipeline {:?} created ({} cached)", pipeline, pipelines.len() + 1);
        pipelines.insert(info.clone(), pipeline);
        Ok(pipeline)
    }

    pub fn get_or_create_compute_pipeline(
        &self,
        backend: &dyn BackendDevice,
        info: &ComputePipelineCreateInfo,
    ) -> Result<RawPipelineHandle, GfxError> {
        let mut pipelines = self.compute_pipelines.lock();
        if let Some(pipeline) = pipelines.get(info) {
            return Ok(*pipeline);
        }

        let pipeline = backend.create_compute_pipeline(info)?;
        log::debug!("compute pipeline {:?} created", pipeline);
        pipelines.insert(info.clone(), pipeline);
        Ok(pipeline)
    }

    /// 移除所有引用 `shader` 的 pipeline，返回被移除的后端对象，由调用方延迟销毁
    pub fn invalidate_shader(&self, shader: RawShaderHandle) -> Vec<RawPipelineHandle> {
        let mut removed = Vec::new();
        self.gfx_pipelines.lock().retain(|info, pipeline| {
            let keep = !info.uses_shader(shader);
            if !keep {
                removed.push(*pipeline);
            }
            keep
        });
        self.compute_pipelines.lock().retain(|info, pipeline| {
            let keep = info.shader_stage.shader != shader;
            if !keep {
                removed.push(*pipeline);
            }
            keep
        });

        if !removed.is_empty() {
            log::info!("{} pipelines invalidated by {:?}", removed.len(), shader);
        }
        removed
    }

    /// 取出全部缓存对象，用于 Device 销毁
    pub fn drain(&self) -> (Vec<RawRenderPassHandle>, Vec<RawPipelineHandle>) {
        let render_passes = self.render_passes.lock().drain().map(|(_, rp)| rp).collect();
        let mut pipelines = self.gfx_pipelines.lock().drain().map(|(_, p)| p).collect::<Vec<_>>();
        pipelines.extend(self.compute_pipelines.lock().drain().map(|(_, p)| p));
        (render_passes, pipelines)
    }
}

#[cfg(test)]
mod tests {
    use ze_gfx::{
        BackendDevice, Format, ShaderStage,
        create_info::{AttachmentDesc, PipelineLayoutCreateInfo, PipelineShaderStage, ShaderCreateInfo},
        handle::RawPipelineLayoutHandle,
        headless::HeadlessBackendDevice,
        types::*,
    };

    use super::*;

    fn shader(backend: &HeadlessBackendDevice, stage: ShaderStage) -> RawShaderHandle {
        backend
            .create_shader(&ShaderCreateInfo {
                stage,
                bytecode: vec![1, 2, 3, 4],
                debug_name: "test".to_string(),
            })
            .unwrap()
    }

    fn pipeline_info(
        vs: RawShaderHandle,
        fs: RawShaderHandle,
        layout: RawPipelineLayoutHandle,
        render_pass: RawRenderPassHandle,
    ) -> GfxPipelineCreateInfo {
        GfxPipelineCreateInfo {
            shader_stages: vec![
                PipelineShaderStage {
                    stage: ShaderStage::Vertex,
                    shader: vs,
                    entry_point: "main".to_string(),
                },
                PipelineShaderStage {
                    stage: ShaderStage::Fragment,
                    shader: fs,
                    entry_point: "main".to_string(),
                },
            ],
            vertex_input: VertexInputState::default(),
            input_assembly: InputAssemblyState::default(),
            rasterizer: RasterizerState::default(),
            multisample: MultisampleState::default(),
            depth_stencil: DepthStencilState::default(),
            color_blend: ColorBlendState {
                attachments: vec![ColorBlendAttachmentState::default()],
            },
            pipeline_layout: layout,
            render_pass,
            subpass: 0,
        }
    }

    struct Fixture {
        backend: HeadlessBackendDevice,
        cache: PipelineCache,
        vs: RawShaderHandle,
        fs: RawShaderHandle,
        layout: RawPipelineLayoutHandle,
        render_pass: RawRenderPassHandle,
    }

    fn fixture() -> Fixture {
        let backend = HeadlessBackendDevice::new();
        let cache = PipelineCache::default();
        let vs = shader(&backend, ShaderStage::Vertex);
        let fs = shader(&backend, ShaderStage::Fragment);
        let layout = backend.create_pipeline_layout(&PipelineLayoutCreateInfo::default()).unwrap();
        let render_pass = cache
            .get_or_create_render_pass(
                &backend,
                &RenderPassCreateInfo {
                    color_attachments: vec![AttachmentDesc::new(
                        Format::R8G8B8A8Unorm,
                        AttachmentLoadOp::Clear,
                        AttachmentStoreOp::Store,
                    )],
                    ..Default::default()
                },
            )
            .unwrap();
        Fixture {
            backend,
            cache,
            vs,
            fs,
            layout,
            render_pass,
        }
    }

    #[test]
    fn test_equal_info_returns_same_pipeline() {
        let f = fixture();
        let info = pipeline_info(f.vs, f.fs, f.layout, f.render_pass);

        let a = f.cache.get_or_create_gfx_pipeline(&f.backend, &info).unwrap();
        let b = f.cache.get_or_create_gfx_pipeline(&f.backend, &info.clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(f.cache.pipeline_count(), 1);
    }

    #[test]
    fn test_any_field_change_creates_new_pipeline() {
        let f = fixture();
        let base = pipeline_info(f.vs, f.fs, f.layout, f.render_pass);
        let base_pipeline = f.cache.get_or_create_gfx_pipeline(&f.backend, &base).unwrap();

        let other_fs = shader(&f.backend, ShaderStage::Fragment);
        let other_layout = f.backend.create_pipeline_layout(&PipelineLayoutCreateInfo::default()).unwrap();
        let variants = [
            GfxPipelineCreateInfo {
                rasterizer: RasterizerState {
                    cull_mode: CullMode::None,
                    ..base.rasterizer
                },
                ..base.clone()
            },
            GfxPipelineCreateInfo {
                depth_stencil: DepthStencilState {
                    depth_test: true,
                    ..base.depth_stencil
                },
                ..base.clone()
            },
            GfxPipelineCreateInfo {
                color_blend: ColorBlendState {
                    attachments: vec![ColorBlendAttachmentState::alpha_blend()],
                },
                ..base.clone()
            },
            GfxPipelineCreateInfo {
                pipeline_layout: other_layout,
                ..base.clone()
            },
            GfxPipelineCreateInfo {
                subpass: 1,
                ..base.clone()
            },
            pipeline_info(f.vs, other_fs, f.layout, f.render_pass),
        ];

        let mut seen = vec![base_pipeline];
        for variant in &variants {
            let pipeline = f.cache.get_or_create_gfx_pipeline(&f.backend, variant).unwrap();
            assert!(!seen.contains(&pipeline), "{:?} reused a cached pipeline", variant);
            seen.push(pipeline);
        }
        assert_eq!(f.cache.pipeline_count(), variants.len() + 1);
    }

    #[test]
    fn test_render_pass_dedup() {
        let f = fixture();
        let info = RenderPassCreateInfo {
            color_attachments: vec![AttachmentDesc::new(
                Format::R8G8B8A8Unorm,
                AttachmentLoadOp::Clear,
                AttachmentStoreOp::Store,
            )],
            ..Default::default()
        };
        assert_eq!(f.cache.get_or_create_render_pass(&f.backend, &info).unwrap(), f.render_pass);

        let load = RenderPassCreateInfo {
            color_attachments: vec![AttachmentDesc::new(
                Format::R8G8B8A8Unorm,
                AttachmentLoadOp::Load,
                AttachmentStoreOp::Store,
            )],
            ..Default::default()
        };
        assert_ne!(f.cache.get_or_create_render_pass(&f.backend, &load).unwrap(), f.render_pass);
        assert_eq!(f.cache.render_pass_count(), 2);
    }

    #[test]
    fn test_invalidate_shader() {
        let f = fixture();
        let other_fs = shader(&f.backend, ShaderStage::Fragment);
        let a = f
            .cache
            .get_or_create_gfx_pipeline(&f.backend, &pipeline_info(f.vs, f.fs, f.layout, f.render_pass))
            .unwrap();
        let b = f
            .cache
            .get_or_create_gfx_pipeline(&f.backend, &pipeline_info(f.vs, other_fs, f.layout, f.render_pass))
            .unwrap();

        assert_eq!(f.cache.invalidate_shader(f.fs), vec![a]);
        assert_eq!(f.cache.pipeline_count(), 1);
        assert_eq!(f.cache.invalidate_shader(f.vs), vec![b]);
        assert_eq!(f.cache.pipeline_count(), 0);
    }
}
