use ze_gfx::{
    DeviceResourceType, GfxError, ShaderStage, ShaderStageFlags,
    commands::{BufferBarrier, BufferCopyRegion, ClearValue, Rect2D, RenderPassBeginInfo, TextureBarrier, Viewport},
    create_info::{
        AttachmentDesc, ComputePipelineCreateInfo, GfxPipelineCreateInfo, PipelineShaderStage, RenderPassCreateInfo,
    },
    descriptor::{DescriptorResource, DescriptorWrite},
    handle::RawPipelineLayoutHandle,
    types::*,
};

use super::Device;
use crate::{
    command_list::{CommandList, Descriptor, DirtyFlags, GraphicsState},
    error::DeviceError,
    handles::*,
    pass_info::{BufferBarrierInfo, RenderPassInfo, TextureBarrierInfo},
    resources::PipelineLayoutEntry,
};

#[inline]
fn bind_point_index(bind_point: PipelineBindPoint) -> usize {
    match bind_point {
        PipelineBindPoint::Graphics => 0,
        PipelineBindPoint::Compute => 1,
    }
}

// Command list API
impl Device {
    /// 从当前帧、当前线程的 command pool 中分配一个 command list 并开始录制
    pub fn allocate_command_list(&self, queue: QueueType) -> Result<CommandList, DeviceError> {
        let (frame_index, epoch) = {
            let counter = self.frame_counter.lock();
            (counter.frame_index(), counter.frame_id())
        };
        let backend = self.backend.as_ref();
        let raw = self.frames[frame_index].command_pool(queue).allocate(backend)?;
        backend.begin_command_list(raw)?;
        Ok(CommandList::new(raw, queue, frame_index, epoch))
    }

    /// 开始 render pass
    ///
    /// 根据 attachment 的格式和 load/store 组合出 render pass 描述并从缓存中取得后端对象，
    /// 同时把 viewport 与 scissor 设置为整个 render area
    pub fn cmd_begin_render_pass(&self, cmd: &mut CommandList, info: &RenderPassInfo) -> Result<(), DeviceError> {
        if cmd.is_in_render_pass() {
            return Err(GfxError::invalid_parameter("render pass begun twice").into());
        }

        let view_entry = |view: TextureViewHandle| {
            self.texture_views
                .with(view, |entry| (entry.raw, entry.format))
                .ok_or(DeviceError::invalid_handle(DeviceResourceType::TextureView))
        };

        let mut color_views = Vec::with_capacity(info.color_attachments.len());
        let mut create_info = RenderPassCreateInfo::default();
        let mut clear_values = Vec::with_capacity(info.color_attachments.len() + 1);
        for attachment in &info.color_attachments {
            let (raw, format) = view_entry(attachment.view)?;
            color_views.push(raw);
            create_info.color_attachments.push(AttachmentDesc {
                initial_layout: attachment.initial_layout,
                final_layout: attachment.final_layout,
                ..AttachmentDesc::new(format, attachment.load_op, attachment.store_op)
            });
            clear_values.push(ClearValue::Color(attachment.clear_color));
        }

        let mut depth_stencil_view = None;
        if let Some(attachment) = &info.depth_stencil_attachment {
            let (raw, format) = view_entry(attachment.view)?;
            depth_stencil_view = Some(raw);
            let mut desc = AttachmentDesc {
                initial_layout: attachment.initial_layout,
                final_layout: attachment.final_layout,
                ..AttachmentDesc::new(format, attachment.load_op, attachment.store_op)
            };
            if format.has_stencil() {
                desc.stencil_load_op = attachment.load_op;
                desc.stencil_store_op = attachment.store_op;
            }
            create_info.depth_stencil_attachment = Some(desc);
            create_info.depth_read_only = attachment.read_only;
            clear_values.push(ClearValue::DepthStencil {
                depth: attachment.clear_depth,
                stencil: attachment.clear_stencil,
            });
        }

        let render_pass = self.get_or_create_render_pass(&create_info)?;
        let backend = self.backend.as_ref();
        backend.cmd_begin_render_pass(
            cmd.raw,
            &RenderPassBeginInfo {
                render_pass,
                color_views,
                depth_stencil_view,
                width: info.width,
                height: info.height,
                clear_values,
            },
        );
        backend.cmd_set_viewport(cmd.raw, &Viewport::new(info.width as f32, info.height as f32));
        backend.cmd_set_scissor(cmd.raw, &Rect2D::from_extent(info.width, info.height));
        cmd.begin_render_pass(render_pass, info.color_attachments.len());
        Ok(())
    }

    pub fn cmd_end_render_pass(&self, cmd: &mut CommandList) -> Result<(), DeviceError> {
        if !cmd.end_render_pass() {
            return Err(DeviceError::NotInRenderPass);
        }
        self.backend.cmd_end_render_pass(cmd.raw);
        Ok(())
    }
}

// Pipeline state API
impl Device {
    pub fn cmd_set_vertex_input_state(&self, cmd: &mut CommandList, state: &VertexInputState) {
        cmd.update_gfx_state(|s| s.vertex_input = state.clone());
    }

    pub fn cmd_set_input_assembly_state(&self, cmd: &mut CommandList, state: InputAssemblyState) {
        cmd.update_gfx_state(|s| s.input_assembly = state);
    }

    pub fn cmd_set_rasterizer_state(&self, cmd: &mut CommandList, state: RasterizerState) {
        cmd.update_gfx_state(|s| s.rasterizer = state);
    }

    pub fn cmd_set_multisample_state(&self, cmd: &mut CommandList, state: MultisampleState) {
        cmd.update_gfx_state(|s| s.multisample = state);
    }

    pub fn cmd_set_depth_stencil_state(&self, cmd: &mut CommandList, state: DepthStencilState) {
        cmd.update_gfx_state(|s| s.depth_stencil = state);
    }

    pub fn cmd_set_color_blend_state(&self, cmd: &mut CommandList, state: &ColorBlendState) {
        cmd.update_gfx_state(|s| s.color_blend = state.clone());
    }

    #[inline]
    pub fn cmd_set_viewport(&self, cmd: &mut CommandList, viewport: &Viewport) {
        self.backend.cmd_set_viewport(cmd.raw, viewport);
    }

    #[inline]
    pub fn cmd_set_scissor(&self, cmd: &mut CommandList, scissor: &Rect2D) {
        self.backend.cmd_set_scissor(cmd.raw, scissor);
    }

    /// 绑定某个 stage 的 shader；stage 由 shader 创建时决定
    pub fn cmd_bind_shader(&self, cmd: &mut CommandList, shader: ShaderHandle, entry_point: &str) -> Result<(), DeviceError> {
        let stage = self
            .shader_stage(shader)
            .ok_or(DeviceError::invalid_handle(DeviceResourceType::Shader))?;
        cmd.set_shader(stage, shader, entry_point);
        Ok(())
    }

    pub fn cmd_bind_pipeline_layout(&self, cmd: &mut CommandList, layout: PipelineLayoutHandle) -> Result<(), DeviceError> {
        if !self.is_valid_pipeline_layout(layout) {
            return Err(DeviceError::invalid_handle(DeviceResourceType::PipelineLayout));
        }
        cmd.set_pipeline_layout(layout);
        Ok(())
    }

    pub fn cmd_push_constants(
        &self,
        cmd: &mut CommandList,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let layout = cmd.pipeline_layout.ok_or(DeviceError::MissingPipelineLayout)?;
        let raw = self
            .pipeline_layout_raw(layout)
            .ok_or(DeviceError::invalid_handle(DeviceResourceType::PipelineLayout))?;
        self.backend.cmd_push_constants(cmd.raw, raw, stages, offset, data);
        Ok(())
    }
}

// Resource binding API
impl Device {
    pub fn cmd_bind_vertex_buffers(
        &self,
        cmd: &mut CommandList,
        first_binding: u32,
        buffers: &[BufferHandle],
        offsets: &[u64],
    ) -> Result<(), DeviceError> {
        debug_assert_eq!(buffers.len(), offsets.len());
        let raw = buffers
            .iter()
            .map(|buffer| self.buffer_raw(*buffer).ok_or(DeviceError::invalid_handle(DeviceResourceType::Buffer)))
            .collect::<Result<Vec<_>, _>>()?;
        self.backend.cmd_bind_vertex_buffers(cmd.raw, first_binding, &raw, offsets);
        Ok(())
    }

    pub fn cmd_bind_index_buffer(
        &self,
        cmd: &mut CommandList,
        buffer: BufferHandle,
        offset: u64,
        index_type: IndexType,
    ) -> Result<(), DeviceError> {
        let raw = self.buffer_raw(buffer).ok_or(DeviceError::invalid_handle(DeviceResourceType::Buffer))?;
        self.backend.cmd_bind_index_buffer(cmd.raw, raw, offset, index_type);
        Ok(())
    }

    /// 绑定到 set >= 1 的普通 descriptor，下一次 draw/dispatch 时写入临时 descriptor set
    pub fn cmd_bind_buffer(
        &self,
        cmd: &mut CommandList,
        set: u32,
        binding: u32,
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    ) -> Result<(), DeviceError> {
        cmd.descriptors.set(set, binding, Descriptor::Buffer { buffer, offset, range })
    }

    pub fn cmd_bind_texture_view(
        &self,
        cmd: &mut CommandList,
        set: u32,
        binding: u32,
        view: TextureViewHandle,
        layout: TextureLayout,
    ) -> Result<(), DeviceError> {
        cmd.descriptors.set(set, binding, Descriptor::TextureView { view, layout })
    }

    pub fn cmd_bind_sampler(
        &self,
        cmd: &mut CommandList,
        set: u32,
        binding: u32,
        sampler: SamplerHandle,
    ) -> Result<(), DeviceError> {
        cmd.descriptors.set(set, binding, Descriptor::Sampler(sampler))
    }
}

// Draw & dispatch API
impl Device {
    pub fn cmd_draw(
        &self,
        cmd: &mut CommandList,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<(), DeviceError> {
        self.flush_graphics_state(cmd)?;
        self.backend
            .cmd_draw(cmd.raw, vertex_count, instance_count, first_vertex, first_instance);
        Ok(())
    }

    pub fn cmd_draw_indexed(
        &self,
        cmd: &mut CommandList,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<(), DeviceError> {
        self.flush_graphics_state(cmd)?;
        self.backend
            .cmd_draw_indexed(cmd.raw, index_count, instance_count, first_index, vertex_offset, first_instance);
        Ok(())
    }

    pub fn cmd_dispatch(&self, cmd: &mut CommandList, x: u32, y: u32, z: u32) -> Result<(), DeviceError> {
        if cmd.is_in_render_pass() {
            return Err(GfxError::invalid_parameter("dispatch inside a render pass").into());
        }
        let layout = self.bound_layout(cmd)?;

        if cmd.dirty.contains(DirtyFlags::COMPUTE_PIPELINE) {
            let (shader, entry_point) = cmd
                .compute_shader
                .clone()
                .ok_or_else(|| GfxError::invalid_parameter("dispatch without a compute shader"))?;
            let raw_shader = self
                .shader_raw(shader)
                .ok_or(DeviceError::invalid_handle(DeviceResourceType::Shader))?;
            let pipeline = self.get_or_create_compute_pipeline(&ComputePipelineCreateInfo {
                shader_stage: PipelineShaderStage {
                    stage: ShaderStage::Compute,
                    shader: raw_shader,
                    entry_point,
                },
                pipeline_layout: layout.raw,
            })?;
            self.bind_pipeline(cmd, PipelineBindPoint::Compute, pipeline);
            cmd.dirty.remove(DirtyFlags::COMPUTE_PIPELINE);
        }

        self.bind_descriptors(cmd, PipelineBindPoint::Compute, &layout)?;
        self.backend.cmd_dispatch(cmd.raw, x, y, z);
        Ok(())
    }

    fn bound_layout(&self, cmd: &CommandList) -> Result<PipelineLayoutEntry, DeviceError> {
        let layout = cmd.pipeline_layout.ok_or(DeviceError::MissingPipelineLayout)?;
        self.pipeline_layouts
            .get_cloned(layout)
            .ok_or(DeviceError::invalid_handle(DeviceResourceType::PipelineLayout))
    }

    /// draw 之前解析图形管线：状态脏时才查找（或创建）pipeline，和已绑定的不同时才重新绑定
    fn flush_graphics_state(&self, cmd: &mut CommandList) -> Result<(), DeviceError> {
        let render_pass = cmd.render_pass.ok_or(DeviceError::NotInRenderPass)?;
        let layout = self.bound_layout(cmd)?;

        if cmd.dirty.contains(DirtyFlags::GFX_PIPELINE) {
            let info = self.gfx_pipeline_info(&cmd.gfx, layout.raw, render_pass.raw, render_pass.color_count)?;
            let pipeline = self.get_or_create_gfx_pipeline(&info)?;
            self.bind_pipeline(cmd, PipelineBindPoint::Graphics, pipeline);
            cmd.dirty.remove(DirtyFlags::GFX_PIPELINE);
        }

        self.bind_descriptors(cmd, PipelineBindPoint::Graphics, &layout)
    }

    fn gfx_pipeline_info(
        &self,
        state: &GraphicsState,
        pipeline_layout: RawPipelineLayoutHandle,
        render_pass: ze_gfx::handle::RawRenderPassHandle,
        color_count: usize,
    ) -> Result<GfxPipelineCreateInfo, DeviceError> {
        if state.shader_stages.is_empty() {
            return Err(GfxError::invalid_parameter("draw without any shader bound").into());
        }
        let shader_stages = state
            .shader_stages
            .iter()
            .map(|(stage, (shader, entry_point))| {
                Ok(PipelineShaderStage {
                    stage: *stage,
                    shader: self
                        .shader_raw(*shader)
                        .ok_or(DeviceError::invalid_handle(DeviceResourceType::Shader))?,
                    entry_point: entry_point.clone(),
                })
            })
            .collect::<Result<Vec<_>, DeviceError>>()?;

        // blend 状态的数量必须和 color attachment 一致
        let mut color_blend = state.color_blend.clone();
        color_blend.attachments.resize(color_count, ColorBlendAttachmentState::default());

        Ok(GfxPipelineCreateInfo {
            shader_stages,
            vertex_input: state.vertex_input.clone(),
            input_assembly: state.input_assembly,
            rasterizer: state.rasterizer,
            multisample: state.multisample,
            depth_stencil: state.depth_stencil,
            color_blend,
            pipeline_layout,
            render_pass,
            subpass: 0,
        })
    }

    fn bind_pipeline(&self, cmd: &mut CommandList, bind_point: PipelineBindPoint, pipeline: ze_gfx::handle::RawPipelineHandle) {
        let slot = &mut cmd.bound_pipelines[bind_point_index(bind_point)];
        if *slot != Some(pipeline) {
            self.backend.cmd_bind_pipeline(cmd.raw, bind_point, pipeline);
            *slot = Some(pipeline);
        }
    }

    /// 绑定 bindless set，并为脏的 set 分配临时 descriptor set
    fn bind_descriptors(
        &self,
        cmd: &mut CommandList,
        bind_point: PipelineBindPoint,
        layout: &PipelineLayoutEntry,
    ) -> Result<(), DeviceError> {
        let backend = self.backend.as_ref();
        let index = bind_point_index(bind_point);
        if cmd.bindless_layouts[index] != Some(layout.raw) {
            backend.cmd_bind_descriptor_sets(cmd.raw, bind_point, layout.raw, 0, &[self.bindless.descriptor_set()]);
            cmd.bindless_layouts[index] = Some(layout.raw);
        }

        if !cmd.descriptors.is_dirty(bind_point) {
            return Ok(());
        }
        let descriptor_pool = self.frames[cmd.frame_index].descriptor_pool;
        for set in cmd.descriptors.take_dirty_sets(bind_point) {
            let (Some(set_layout), Some(bindings)) =
                (layout.info.set_layouts.get(set as usize), cmd.descriptors.bindings(set))
            else {
                log::warn!("descriptors bound to set {} which the pipeline layout does not declare", set);
                continue;
            };

            let raw_set = backend.allocate_descriptor_set(descriptor_pool, layout.raw, set)?;
            let mut writes = Vec::with_capacity(bindings.len());
            for (binding, descriptor) in bindings {
                let Some(layout_binding) = set_layout.binding(*binding) else {
                    log::warn!("set {} has no binding {}", set, binding);
                    continue;
                };
                writes.push(DescriptorWrite {
                    set: raw_set,
                    binding: *binding,
                    array_element: 0,
                    ty: layout_binding.ty,
                    resource: self.resolve_descriptor(descriptor)?,
                });
            }
            backend.update_descriptor_sets(&writes);
            backend.cmd_bind_descriptor_sets(cmd.raw, bind_point, layout.raw, set, &[raw_set]);
        }
        Ok(())
    }

    fn resolve_descriptor(&self, descriptor: &Descriptor) -> Result<DescriptorResource, DeviceError> {
        Ok(match *descriptor {
            Descriptor::Buffer { buffer, offset, range } => DescriptorResource::Buffer {
                buffer: self.buffer_raw(buffer).ok_or(DeviceError::invalid_handle(DeviceResourceType::Buffer))?,
                offset,
                range,
            },
            Descriptor::TextureView { view, layout } => DescriptorResource::TextureView {
                view: self
                    .texture_views
                    .with(view, |entry| entry.raw)
                    .ok_or(DeviceError::invalid_handle(DeviceResourceType::TextureView))?,
                layout,
            },
            Descriptor::Sampler(sampler) => DescriptorResource::Sampler(
                self.samplers
                    .with(sampler, |entry| entry.raw)
                    .ok_or(DeviceError::invalid_handle(DeviceResourceType::Sampler))?,
            ),
        })
    }
}

// Transfer & barrier API
impl Device {
    pub fn cmd_pipeline_barrier(
        &self,
        cmd: &mut CommandList,
        texture_barriers: &[TextureBarrierInfo],
        buffer_barriers: &[BufferBarrierInfo],
    ) -> Result<(), DeviceError> {
        let textures = texture_barriers
            .iter()
            .map(|barrier| {
                let texture = self
                    .textures
                    .with(barrier.texture, |entry| entry.raw)
                    .ok_or(DeviceError::invalid_handle(DeviceResourceType::Texture))?;
                Ok(TextureBarrier {
                    texture,
                    src_stage: barrier.src_stage,
                    src_access: barrier.src_access,
                    dst_stage: barrier.dst_stage,
                    dst_access: barrier.dst_access,
                    old_layout: barrier.old_layout,
                    new_layout: barrier.new_layout,
                    range: barrier.range,
                })
            })
            .collect::<Result<Vec<_>, DeviceError>>()?;
        let buffers = buffer_barriers
            .iter()
            .map(|barrier| {
                let buffer = self
                    .buffer_raw(barrier.buffer)
                    .ok_or(DeviceError::invalid_handle(DeviceResourceType::Buffer))?;
                Ok(BufferBarrier {
                    buffer,
                    src_stage: barrier.src_stage,
                    src_access: barrier.src_access,
                    dst_stage: barrier.dst_stage,
                    dst_access: barrier.dst_access,
                    offset: 0,
                    size: u64::MAX,
                })
            })
            .collect::<Result<Vec<_>, DeviceError>>()?;

        if textures.is_empty() && buffers.is_empty() {
            return Ok(());
        }
        self.backend.cmd_pipeline_barrier(cmd.raw, &textures, &buffers);
        Ok(())
    }

    pub fn cmd_copy_buffer(
        &self,
        cmd: &mut CommandList,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[BufferCopyRegion],
    ) -> Result<(), DeviceError> {
        let src = self.buffer_raw(src).ok_or(DeviceError::invalid_handle(DeviceResourceType::Buffer))?;
        let dst = self.buffer_raw(dst).ok_or(DeviceError::invalid_handle(DeviceResourceType::Buffer))?;
        self.backend.cmd_copy_buffer(cmd.raw, src, dst, regions);
        Ok(())
    }
}
