use std::{io::Cursor, ptr::NonNull};

use ash::vk;
use itertools::Itertools;
use vk_mem::Alloc;
use ze_gfx::{
    BackendDevice, GfxError, GfxResult, ShaderStageFlags, SwapchainDesc,
    commands::*,
    create_info::*,
    descriptor::{DescriptorPoolCreateInfo, DescriptorResource, DescriptorWrite},
    handle::*,
    types::{IndexType, PipelineBindPoint, PipelineStage, QueueType, TextureType},
};

use crate::{
    conv::{self, vk_error},
    device::{
        VulkanBackendDevice, VulkanBuffer, VulkanCommandList, VulkanCommandPool, VulkanDescriptorSet,
        VulkanPipelineLayout, VulkanTexture, VulkanTextureView,
    },
};

/// descriptor 写入前解析出的资源信息
enum ResolvedDescriptor {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

// tools
impl VulkanBackendDevice {
    /// 录制命令时句柄失效只记录错误，后续的 submit 会暴露问题
    fn command_buffer(&self, list: RawCommandListHandle) -> Option<vk::CommandBuffer> {
        match self.command_lists.get(list) {
            Ok(list) => Some(list.handle),
            Err(e) => {
                log::error!("vulkan: record into invalid command list: {}", e);
                None
            }
        }
    }

    fn resolve_descriptor(&self, write: &DescriptorWrite) -> Result<(vk::DescriptorSet, ResolvedDescriptor), GfxError> {
        let set = self.descriptor_sets.get(write.set)?.handle;
        let resolved = match write.resource {
            DescriptorResource::Buffer { buffer, offset, range } => {
                let buffer = self.buffers.with(buffer, |buffer| buffer.handle)?;
                ResolvedDescriptor::Buffer(vk::DescriptorBufferInfo::default().buffer(buffer).offset(offset).range(range))
            }
            DescriptorResource::TextureView { view, layout } => {
                let view = self.texture_views.get(view)?.handle;
                ResolvedDescriptor::Image(
                    vk::DescriptorImageInfo::default().image_view(view).image_layout(conv::layout(layout)),
                )
            }
            DescriptorResource::Sampler(sampler) => {
                let sampler = self.samplers.get(sampler)?;
                ResolvedDescriptor::Image(vk::DescriptorImageInfo::default().sampler(sampler))
            }
        };
        Ok((set, resolved))
    }
}

impl BackendDevice for VulkanBackendDevice {
    // Buffer API
    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<RawBufferHandle, GfxError> {
        let _span = tracy_client::span!("VulkanBackendDevice::create_buffer");
        if info.size == 0 {
            return Err(GfxError::invalid_parameter("buffer size is zero"));
        }
        let buffer_ci = vk::BufferCreateInfo::default()
            .size(info.size)
            .usage(conv::buffer_usage(info.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let alloc_ci = conv::allocation_info(info.memory_usage);
        let (handle, allocation) = unsafe { self.allocator.create_buffer(&buffer_ci, &alloc_ci) }.map_err(vk_error)?;
        self.set_debug_name(handle, &info.debug_name);

        Ok(self.buffers.insert(VulkanBuffer { handle, allocation }))
    }

    fn destroy_buffer(&self, buffer: RawBufferHandle) {
        if let Some(mut buffer) = self.buffers.remove(buffer) {
            unsafe { self.allocator.destroy_buffer(buffer.handle, &mut buffer.allocation) };
        }
    }

    fn map_buffer(&self, buffer: RawBufferHandle) -> Result<NonNull<u8>, GfxError> {
        let ptr = self.buffers.with_mut(buffer, |buffer| unsafe { self.allocator.map_memory(&mut buffer.allocation) })?;
        let ptr = ptr.map_err(vk_error)?;
        NonNull::new(ptr).ok_or_else(|| GfxError::invalid_parameter("buffer memory is not host visible"))
    }

    fn unmap_buffer(&self, buffer: RawBufferHandle) {
        let result = self.buffers.with_mut(buffer, |buffer| unsafe { self.allocator.unmap_memory(&mut buffer.allocation) });
        if let Err(e) = result {
            log::error!("vulkan: unmap failed: {}", e);
        }
    }

    // Texture API
    fn create_texture(&self, info: &TextureCreateInfo) -> Result<RawTextureHandle, GfxError> {
        let _span = tracy_client::span!("VulkanBackendDevice::create_texture");
        if info.width == 0 || info.height == 0 || info.depth == 0 {
            return Err(GfxError::invalid_parameter(format!(
                "texture {:?} has zero extent {}x{}x{}",
                info.debug_name, info.width, info.height, info.depth
            )));
        }
        let (image_type, flags) = match info.texture_type {
            TextureType::Texture2D => (vk::ImageType::TYPE_2D, vk::ImageCreateFlags::empty()),
            TextureType::TextureCube => (vk::ImageType::TYPE_2D, vk::ImageCreateFlags::CUBE_COMPATIBLE),
            TextureType::Texture3D => (vk::ImageType::TYPE_3D, vk::ImageCreateFlags::empty()),
        };
        let image_ci = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(image_type)
            .format(conv::format(info.format))
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: info.depth,
            })
            .mip_levels(info.mip_levels.max(1))
            .array_layers(info.array_layers.max(1))
            .samples(conv::samples(info.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(conv::texture_usage(info.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let alloc_ci = conv::allocation_info(info.memory_usage);
        let (handle, allocation) = unsafe { self.allocator.create_image(&image_ci, &alloc_ci) }.map_err(vk_error)?;
        self.set_debug_name(handle, &info.debug_name);

        Ok(self.textures.insert(VulkanTexture {
            handle,
            allocation: Some(allocation),
            format: info.format,
        }))
    }

    fn destroy_texture(&self, texture: RawTextureHandle) {
        // 交换链的 image 随交换链一起销毁
        if self.textures.with(texture, |texture| texture.allocation.is_none()).unwrap_or(false) {
            log::error!("vulkan: {:?} belongs to a swapchain and cannot be destroyed", texture);
            return;
        }
        if let Some(VulkanTexture {
            handle,
            allocation: Some(mut allocation),
            ..
        }) = self.textures.remove(texture)
        {
            unsafe { self.allocator.destroy_image(handle, &mut allocation) };
        }
    }

    fn create_texture_view(&self, info: &TextureViewCreateInfo) -> Result<RawTextureViewHandle, GfxError> {
        let (image, texture_format) = self.textures.with(info.texture, |texture| (texture.handle, texture.format))?;
        let format = if info.format == ze_gfx::Format::Undefined { texture_format } else { info.format };
        let view_ci = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(conv::texture_view_type(info.view_type))
            .format(conv::format(format))
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(conv::view_aspect(format))
                    .base_mip_level(info.range.base_mip_level)
                    .level_count(info.range.level_count)
                    .base_array_layer(info.range.base_array_layer)
                    .layer_count(info.range.layer_count),
            );
        let handle = unsafe { self.device.create_image_view(&view_ci, None) }.map_err(vk_error)?;
        self.set_debug_name(handle, &info.debug_name);

        Ok(self.texture_views.insert(VulkanTextureView { handle }))
    }

    fn destroy_texture_view(&self, view: RawTextureViewHandle) {
        self.evict_framebuffers(|key| key.views.contains(&view));
        if let Some(view) = self.texture_views.remove(view) {
            unsafe { self.device.destroy_image_view(view.handle, None) };
        }
    }

    fn create_sampler(&self, info: &SamplerCreateInfo) -> Result<RawSamplerHandle, GfxError> {
        let anisotropy = info.max_anisotropy > 0 && self.anisotropy_supported;
        let sampler_ci = vk::SamplerCreateInfo::default()
            .mag_filter(conv::filter(info.mag_filter))
            .min_filter(conv::filter(info.min_filter))
            .mipmap_mode(conv::mipmap_mode(info.mipmap_mode))
            .address_mode_u(conv::address_mode(info.address_mode_u))
            .address_mode_v(conv::address_mode(info.address_mode_v))
            .address_mode_w(conv::address_mode(info.address_mode_w))
            .anisotropy_enable(anisotropy)
            .max_anisotropy(if anisotropy { info.max_anisotropy as f32 } else { 1.0 })
            .compare_enable(info.compare_op.is_some())
            .compare_op(info.compare_op.map(conv::compare_op).unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);
        let sampler = unsafe { self.device.create_sampler(&sampler_ci, None) }.map_err(vk_error)?;
        Ok(self.samplers.insert(sampler))
    }

    fn destroy_sampler(&self, sampler: RawSamplerHandle) {
        if let Some(sampler) = self.samplers.remove(sampler) {
            unsafe { self.device.destroy_sampler(sampler, None) };
        }
    }

    // Shader & pipeline API
    fn create_shader(&self, info: &ShaderCreateInfo) -> Result<RawShaderHandle, GfxError> {
        let _span = tracy_client::span!("VulkanBackendDevice::create_shader");
        let code = ash::util::read_spv(&mut Cursor::new(&info.bytecode))
            .map_err(|e| GfxError::invalid_parameter(format!("shader {:?} is not spir-v: {}", info.debug_name, e)))?;
        let shader_ci = vk::ShaderModuleCreateInfo::default().code(&code);
        let shader = unsafe { self.device.create_shader_module(&shader_ci, None) }.map_err(vk_error)?;
        self.set_debug_name(shader, &info.debug_name);
        Ok(self.shaders.insert(shader))
    }

    fn destroy_shader(&self, shader: RawShaderHandle) {
        if let Some(shader) = self.shaders.remove(shader) {
            unsafe { self.device.destroy_shader_module(shader, None) };
        }
    }

    fn create_render_pass(&self, info: &RenderPassCreateInfo) -> Result<RawRenderPassHandle, GfxError> {
        let render_pass = self.create_vk_render_pass(info)?;
        Ok(self.render_passes.insert((render_pass, info.clone())))
    }

    fn destroy_render_pass(&self, render_pass: RawRenderPassHandle) {
        self.evict_framebuffers(|key| key.render_pass == render_pass);
        if let Some((render_pass, _)) = self.render_passes.remove(render_pass) {
            unsafe { self.device.destroy_render_pass(render_pass, None) };
        }
    }

    fn create_pipeline_layout(&self, info: &PipelineLayoutCreateInfo) -> Result<RawPipelineLayoutHandle, GfxError> {
        let (handle, set_layouts) = self.create_vk_pipeline_layout(info)?;
        Ok(self.pipeline_layouts.insert(VulkanPipelineLayout { handle, set_layouts }))
    }

    fn destroy_pipeline_layout(&self, layout: RawPipelineLayoutHandle) {
        if let Some(layout) = self.pipeline_layouts.remove(layout) {
            unsafe { self.device.destroy_pipeline_layout(layout.handle, None) };
            self.destroy_set_layouts(&layout.set_layouts);
        }
    }

    fn create_gfx_pipeline(&self, info: &GfxPipelineCreateInfo) -> Result<RawPipelineHandle, GfxError> {
        let pipeline = self.create_vk_gfx_pipeline(info)?;
        Ok(self.pipelines.insert(pipeline))
    }

    fn create_compute_pipeline(&self, info: &ComputePipelineCreateInfo) -> Result<RawPipelineHandle, GfxError> {
        let pipeline = self.create_vk_compute_pipeline(info)?;
        Ok(self.pipelines.insert(pipeline))
    }

    fn destroy_pipeline(&self, pipeline: RawPipelineHandle) {
        if let Some(pipeline) = self.pipelines.remove(pipeline) {
            unsafe { self.device.destroy_pipeline(pipeline, None) };
        }
    }

    // Descriptor API
    fn create_descriptor_pool(&self, info: &DescriptorPoolCreateInfo) -> Result<RawDescriptorPoolHandle, GfxError> {
        let pool_sizes = info
            .pool_sizes
            .iter()
            .filter(|(_, count)| *count > 0)
            .map(|(ty, count)| vk::DescriptorPoolSize {
                ty: conv::descriptor_type(*ty),
                descriptor_count: *count,
            })
            .collect_vec();
        let flags = if info.update_after_bind {
            vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND
        } else {
            vk::DescriptorPoolCreateFlags::empty()
        };
        let pool_ci = vk::DescriptorPoolCreateInfo::default()
            .flags(flags)
            .max_sets(info.max_sets)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&pool_ci, None) }.map_err(vk_error)?;
        Ok(self.descriptor_pools.insert(pool))
    }

    fn destroy_descriptor_pool(&self, pool: RawDescriptorPoolHandle) {
        self.descriptor_sets.drain_filter(|set| set.pool == pool);
        if let Some(pool) = self.descriptor_pools.remove(pool) {
            unsafe { self.device.destroy_descriptor_pool(pool, None) };
        }
    }

    fn reset_descriptor_pool(&self, pool: RawDescriptorPoolHandle) -> Result<(), GfxError> {
        let vk_pool = self.descriptor_pools.get(pool)?;
        unsafe { self.device.reset_descriptor_pool(vk_pool, vk::DescriptorPoolResetFlags::empty()) }
            .map_err(vk_error)?;
        self.descriptor_sets.drain_filter(|set| set.pool == pool);
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        pool: RawDescriptorPoolHandle,
        layout: RawPipelineLayoutHandle,
        set: u32,
    ) -> Result<RawDescriptorSetHandle, GfxError> {
        let vk_pool = self.descriptor_pools.get(pool)?;
        let set_layout = self
            .pipeline_layouts
            .with(layout, |layout| layout.set_layouts.get(set as usize).copied())?
            .ok_or_else(|| GfxError::invalid_parameter(format!("{:?} has no set {}", layout, set)))?;

        let set_layouts = [set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default().descriptor_pool(vk_pool).set_layouts(&set_layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }.map_err(vk_error)?;
        let handle = sets
            .first()
            .copied()
            .ok_or_else(|| GfxError::Unknown("vkAllocateDescriptorSets returned no set".to_string()))?;
        Ok(self.descriptor_sets.insert(VulkanDescriptorSet { handle, pool }))
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let _span = tracy_client::span!("VulkanBackendDevice::update_descriptor_sets");
        // image/buffer info 需要先全部确定下来，write 中保存的是它们的地址
        let resolved = writes
            .iter()
            .filter_map(|write| match self.resolve_descriptor(write) {
                Ok((set, info)) => Some((write, set, info)),
                Err(e) => {
                    log::error!("vulkan: skip descriptor write to binding {}: {}", write.binding, e);
                    None
                }
            })
            .collect_vec();

        let vk_writes = resolved
            .iter()
            .map(|(write, set, info)| {
                let vk_write = vk::WriteDescriptorSet::default()
                    .dst_set(*set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(conv::descriptor_type(write.ty));
                match info {
                    ResolvedDescriptor::Buffer(info) => vk_write.buffer_info(std::slice::from_ref(info)),
                    ResolvedDescriptor::Image(info) => vk_write.image_info(std::slice::from_ref(info)),
                }
            })
            .collect_vec();
        if vk_writes.is_empty() {
            return;
        }
        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    // Command API
    fn create_command_pool(&self, queue: QueueType) -> Result<RawCommandPoolHandle, GfxError> {
        let pool_ci = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue(queue).family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let handle = unsafe { self.device.create_command_pool(&pool_ci, None) }.map_err(vk_error)?;
        Ok(self.command_pools.insert(VulkanCommandPool { handle }))
    }

    fn destroy_command_pool(&self, pool: RawCommandPoolHandle) {
        // command buffer 随 pool 一起释放
        self.command_lists.drain_filter(|list| list.pool == pool);
        if let Some(pool) = self.command_pools.remove(pool) {
            unsafe { self.device.destroy_command_pool(pool.handle, None) };
        }
    }

    fn reset_command_pool(&self, pool: RawCommandPoolHandle) -> Result<(), GfxError> {
        let _span = tracy_client::span!("VulkanBackendDevice::reset_command_pool");
        let vk_pool = self.command_pools.get(pool)?.handle;
        unsafe { self.device.reset_command_pool(vk_pool, vk::CommandPoolResetFlags::RELEASE_RESOURCES) }
            .map_err(vk_error)
    }

    fn allocate_command_list(&self, pool: RawCommandPoolHandle) -> Result<RawCommandListHandle, GfxError> {
        let vk_pool = self.command_pools.get(pool)?.handle;
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(vk_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }.map_err(vk_error)?;
        let handle = buffers
            .first()
            .copied()
            .ok_or_else(|| GfxError::Unknown("vkAllocateCommandBuffers returned no buffer".to_string()))?;
        Ok(self.command_lists.insert(VulkanCommandList { handle, pool }))
    }

    fn begin_command_list(&self, list: RawCommandListHandle) -> Result<(), GfxError> {
        let cb = self.command_lists.get(list)?.handle;
        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cb, &begin_info) }.map_err(vk_error)
    }

    fn end_command_list(&self, list: RawCommandListHandle) -> Result<(), GfxError> {
        let cb = self.command_lists.get(list)?.handle;
        unsafe { self.device.end_command_buffer(cb) }.map_err(vk_error)
    }

    fn cmd_begin_render_pass(&self, list: RawCommandListHandle, info: &RenderPassBeginInfo) {
        let Some(cb) = self.command_buffer(list) else {
            return;
        };
        let views = info.color_views.iter().copied().chain(info.depth_stencil_view).collect_vec();
        let render_pass = match self.render_passes.with(info.render_pass, |(handle, _)| *handle) {
            Ok(render_pass) => render_pass,
            Err(e) => {
                log::error!("vulkan: begin render pass: {}", e);
                return;
            }
        };
        let framebuffer = match self.get_or_create_framebuffer(info.render_pass, views, info.width, info.height) {
            Ok(framebuffer) => framebuffer,
            Err(e) => {
                log::error!("vulkan: begin render pass: {}", e);
                return;
            }
        };

        let clear_values = info.clear_values.iter().map(|value| conv::clear_value(*value)).collect_vec();
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: info.width,
                    height: info.height,
                },
            })
            .clear_values(&clear_values);
        unsafe { self.device.cmd_begin_render_pass(cb, &begin_info, vk::SubpassContents::INLINE) };
    }

    fn cmd_end_render_pass(&self, list: RawCommandListHandle) {
        if let Some(cb) = self.command_buffer(list) {
            unsafe { self.device.cmd_end_render_pass(cb) };
        }
    }

    fn cmd_bind_pipeline(&self, list: RawCommandListHandle, bind_point: PipelineBindPoint, pipeline: RawPipelineHandle) {
        let Some(cb) = self.command_buffer(list) else {
            return;
        };
        match self.pipelines.get(pipeline) {
            Ok(pipeline) => unsafe { self.device.cmd_bind_pipeline(cb, conv::bind_point(bind_point), pipeline) },
            Err(e) => log::error!("vulkan: bind pipeline: {}", e),
        }
    }

    fn cmd_bind_descriptor_sets(
        &self,
        list: RawCommandListHandle,
        bind_point: PipelineBindPoint,
        layout: RawPipelineLayoutHandle,
        first_set: u32,
        sets: &[RawDescriptorSetHandle],
    ) {
        let Some(cb) = self.command_buffer(list) else {
            return;
        };
        let layout = self.pipeline_layouts.with(layout, |layout| layout.handle);
        let sets = sets.iter().map(|set| self.descriptor_sets.get(*set).map(|set| set.handle)).collect::<Result<Vec<_>, _>>();
        match (layout, sets) {
            (Ok(layout), Ok(sets)) => unsafe {
                self.device.cmd_bind_descriptor_sets(cb, conv::bind_point(bind_point), layout, first_set, &sets, &[])
            },
            (Err(e), _) | (_, Err(e)) => log::error!("vulkan: bind descriptor sets: {}", e),
        }
    }

    fn cmd_push_constants(
        &self,
        list: RawCommandListHandle,
        layout: RawPipelineLayoutHandle,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        let Some(cb) = self.command_buffer(list) else {
            return;
        };
        match self.pipeline_layouts.with(layout, |layout| layout.handle) {
            Ok(layout) => unsafe {
                self.device.cmd_push_constants(cb, layout, conv::shader_stage_flags(stages), offset, data)
            },
            Err(e) => log::error!("vulkan: push constants: {}", e),
        }
    }

    fn cmd_bind_vertex_buffers(
        &self,
        list: RawCommandListHandle,
        first_binding: u32,
        buffers: &[RawBufferHandle],
        offsets: &[u64],
    ) {
        let Some(cb) = self.command_buffer(list) else {
            return;
        };
        let buffers =
            buffers.iter().map(|buffer| self.buffers.with(*buffer, |buffer| buffer.handle)).collect::<Result<Vec<_>, _>>();
        match buffers {
            Ok(buffers) => unsafe { self.device.cmd_bind_vertex_buffers(cb, first_binding, &buffers, offsets) },
            Err(e) => log::error!("vulkan: bind vertex buffers: {}", e),
        }
    }

    fn cmd_bind_index_buffer(&self, list: RawCommandListHandle, buffer: RawBufferHandle, offset: u64, ty: IndexType) {
        let Some(cb) = self.command_buffer(list) else {
            return;
        };
        match self.buffers.with(buffer, |buffer| buffer.handle) {
            Ok(buffer) => unsafe { self.device.cmd_bind_index_buffer(cb, buffer, offset, conv::index_type(ty)) },
            Err(e) => log::error!("vulkan: bind index buffer: {}", e),
        }
    }

    fn cmd_set_viewport(&self, list: RawCommandListHandle, viewport: &Viewport) {
        let Some(cb) = self.command_buffer(list) else {
            return;
        };
        let viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        unsafe { self.device.cmd_set_viewport(cb, 0, &[viewport]) };
    }

    fn cmd_set_scissor(&self, list: RawCommandListHandle, scissor: &Rect2D) {
        let Some(cb) = self.command_buffer(list) else {
            return;
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: scissor.x,
                y: scissor.y,
            },
            extent: vk::Extent2D {
                width: scissor.width,
                height: scissor.height,
            },
        };
        unsafe { self.device.cmd_set_scissor(cb, 0, &[scissor]) };
    }

    fn cmd_draw(
        &self,
        list: RawCommandListHandle,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        if let Some(cb) = self.command_buffer(list) {
            unsafe { self.device.cmd_draw(cb, vertex_count, instance_count, first_vertex, first_instance) };
        }
    }

    fn cmd_draw_indexed(
        &self,
        list: RawCommandListHandle,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        if let Some(cb) = self.command_buffer(list) {
            unsafe {
                self.device.cmd_draw_indexed(cb, index_count, instance_count, first_index, vertex_offset, first_instance)
            };
        }
    }

    fn cmd_dispatch(&self, list: RawCommandListHandle, x: u32, y: u32, z: u32) {
        if let Some(cb) = self.command_buffer(list) {
            unsafe { self.device.cmd_dispatch(cb, x, y, z) };
        }
    }

    fn cmd_copy_buffer(
        &self,
        list: RawCommandListHandle,
        src: RawBufferHandle,
        dst: RawBufferHandle,
        regions: &[BufferCopyRegion],
    ) {
        let Some(cb) = self.command_buffer(list) else {
            return;
        };
        let src = self.buffers.with(src, |buffer| buffer.handle);
        let dst = self.buffers.with(dst, |buffer| buffer.handle);
        let regions = regions
            .iter()
            .map(|region| vk::BufferCopy {
                src_offset: region.src_offset,
                dst_offset: region.dst_offset,
                size: region.size,
            })
            .collect_vec();
        match (src, dst) {
            (Ok(src), Ok(dst)) => unsafe { self.device.cmd_copy_buffer(cb, src, dst, &regions) },
            (Err(e), _) | (_, Err(e)) => log::error!("vulkan: copy buffer: {}", e),
        }
    }

    fn cmd_copy_buffer_to_texture(
        &self,
        list: RawCommandListHandle,
        src: RawBufferHandle,
        dst: RawTextureHandle,
        regions: &[BufferTextureCopyRegion],
    ) {
        let Some(cb) = self.command_buffer(list) else {
            return;
        };
        let src = self.buffers.with(src, |buffer| buffer.handle);
        let dst = self.textures.with(dst, |texture| (texture.handle, texture.format));
        match (src, dst) {
            (Ok(src), Ok((image, format))) => {
                let regions = regions
                    .iter()
                    .map(|region| {
                        vk::BufferImageCopy::default()
                            .buffer_offset(region.buffer_offset)
                            .image_subresource(
                                vk::ImageSubresourceLayers::default()
                                    .aspect_mask(conv::view_aspect(format))
                                    .mip_level(region.mip_level)
                                    .base_array_layer(region.base_array_layer)
                                    .layer_count(region.layer_count),
                            )
                            .image_extent(vk::Extent3D {
                                width: region.width,
                                height: region.height,
                                depth: region.depth,
                            })
                    })
                    .collect_vec();
                unsafe {
                    self.device.cmd_copy_buffer_to_image(
                        cb,
                        src,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &regions,
                    )
                };
            }
            (Err(e), _) | (_, Err(e)) => log::error!("vulkan: copy buffer to texture: {}", e),
        }
    }

    fn cmd_pipeline_barrier(
        &self,
        list: RawCommandListHandle,
        texture_barriers: &[TextureBarrier],
        buffer_barriers: &[BufferBarrier],
    ) {
        let _span = tracy_client::span!("VulkanBackendDevice::cmd_pipeline_barrier");
        let Some(cb) = self.command_buffer(list) else {
            return;
        };
        if texture_barriers.is_empty() && buffer_barriers.is_empty() {
            return;
        }

        let mut src_stage = PipelineStage::empty();
        let mut dst_stage = PipelineStage::empty();
        let mut image_barriers = Vec::with_capacity(texture_barriers.len());
        for barrier in texture_barriers {
            let (image, format) = match self.textures.with(barrier.texture, |texture| (texture.handle, texture.format)) {
                Ok(texture) => texture,
                Err(e) => {
                    log::error!("vulkan: texture barrier: {}", e);
                    continue;
                }
            };
            src_stage |= barrier.src_stage;
            dst_stage |= barrier.dst_stage;
            image_barriers.push(
                vk::ImageMemoryBarrier::default()
                    .image(image)
                    .src_access_mask(conv::access(barrier.src_access))
                    .dst_access_mask(conv::access(barrier.dst_access))
                    .old_layout(conv::layout(barrier.old_layout))
                    .new_layout(conv::layout(barrier.new_layout))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(conv::aspect(format))
                            .base_mip_level(barrier.range.base_mip_level)
                            .level_count(barrier.range.level_count)
                            .base_array_layer(barrier.range.base_array_layer)
                            .layer_count(barrier.range.layer_count),
                    ),
            );
        }

        let mut vk_buffer_barriers = Vec::with_capacity(buffer_barriers.len());
        for barrier in buffer_barriers {
            let buffer = match self.buffers.with(barrier.buffer, |buffer| buffer.handle) {
                Ok(buffer) => buffer,
                Err(e) => {
                    log::error!("vulkan: buffer barrier: {}", e);
                    continue;
                }
            };
            src_stage |= barrier.src_stage;
            dst_stage |= barrier.dst_stage;
            vk_buffer_barriers.push(
                vk::BufferMemoryBarrier::default()
                    .buffer(buffer)
                    .src_access_mask(conv::access(barrier.src_access))
                    .dst_access_mask(conv::access(barrier.dst_access))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .offset(barrier.offset)
                    // u64::MAX 与 VK_WHOLE_SIZE 相同
                    .size(barrier.size),
            );
        }
        if image_barriers.is_empty() && vk_buffer_barriers.is_empty() {
            return;
        }

        unsafe {
            self.device.cmd_pipeline_barrier(
                cb,
                conv::pipeline_stage(src_stage),
                conv::pipeline_stage(dst_stage),
                vk::DependencyFlags::empty(),
                &[],
                &vk_buffer_barriers,
                &image_barriers,
            )
        };
    }

    // Queue & sync API
    fn queue_submit(
        &self,
        queue: QueueType,
        lists: &[RawCommandListHandle],
        wait_semaphores: &[RawSemaphoreHandle],
        wait_stages: &[PipelineStage],
        signal_semaphores: &[RawSemaphoreHandle],
        fence: Option<RawFenceHandle>,
    ) -> Result<(), GfxError> {
        let _span = tracy_client::span!("VulkanBackendDevice::queue_submit");
        if wait_semaphores.len() != wait_stages.len() {
            return Err(GfxError::invalid_parameter(format!(
                "{} wait semaphores but {} wait stages",
                wait_semaphores.len(),
                wait_stages.len()
            )));
        }
        let command_buffers =
            lists.iter().map(|list| self.command_lists.get(*list).map(|list| list.handle)).collect::<Result<Vec<_>, _>>()?;
        let wait_semaphores =
            wait_semaphores.iter().map(|semaphore| self.semaphores.get(*semaphore)).collect::<Result<Vec<_>, _>>()?;
        let signal_semaphores =
            signal_semaphores.iter().map(|semaphore| self.semaphores.get(*semaphore)).collect::<Result<Vec<_>, _>>()?;
        let wait_stages = wait_stages.iter().map(|stage| conv::pipeline_stage(*stage)).collect_vec();
        let fence = fence.map(|fence| self.fences.get(fence)).transpose()?.unwrap_or_default();

        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores);
        let queue = self.queue(queue).handle.lock();
        unsafe { self.device.queue_submit(*queue, std::slice::from_ref(&submit_info), fence) }.map_err(vk_error)
    }

    fn create_fence(&self, signaled: bool) -> Result<RawFenceHandle, GfxError> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None) }
            .map_err(vk_error)?;
        Ok(self.fences.insert(fence))
    }

    fn destroy_fence(&self, fence: RawFenceHandle) {
        if let Some(fence) = self.fences.remove(fence) {
            unsafe { self.device.destroy_fence(fence, None) };
        }
    }

    fn wait_for_fences(&self, fences: &[RawFenceHandle], wait_all: bool, timeout_ns: u64) -> GfxResult {
        let _span = tracy_client::span!("VulkanBackendDevice::wait_for_fences");
        let Ok(fences) = fences.iter().map(|fence| self.fences.get(*fence)).collect::<Result<Vec<_>, _>>() else {
            return GfxResult::ErrorInvalidParameter;
        };
        if fences.is_empty() {
            return GfxResult::Success;
        }
        match unsafe { self.device.wait_for_fences(&fences, wait_all, timeout_ns) } {
            Ok(()) => GfxResult::Success,
            Err(e) => conv::gfx_result(e),
        }
    }

    fn reset_fences(&self, fences: &[RawFenceHandle]) -> Result<(), GfxError> {
        let fences = fences.iter().map(|fence| self.fences.get(*fence)).collect::<Result<Vec<_>, _>>()?;
        if fences.is_empty() {
            return Ok(());
        }
        unsafe { self.device.reset_fences(&fences) }.map_err(vk_error)
    }

    fn create_semaphore(&self) -> Result<RawSemaphoreHandle, GfxError> {
        let semaphore =
            unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }.map_err(vk_error)?;
        Ok(self.semaphores.insert(semaphore))
    }

    fn destroy_semaphore(&self, semaphore: RawSemaphoreHandle) {
        if let Some(semaphore) = self.semaphores.remove(semaphore) {
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn wait_idle(&self) -> Result<(), GfxError> {
        let _span = tracy_client::span!("VulkanBackendDevice::wait_idle");
        unsafe { self.device.device_wait_idle() }.map_err(vk_error)
    }

    // Swapchain API
    fn create_swapchain(&self, info: &SwapchainCreateInfo) -> Result<RawSwapchainHandle, GfxError> {
        self.create_vk_swapchain(info)
    }

    fn destroy_swapchain(&self, swapchain: RawSwapchainHandle) {
        self.destroy_vk_swapchain(swapchain)
    }

    fn swapchain_desc(&self, swapchain: RawSwapchainHandle) -> Result<SwapchainDesc, GfxError> {
        self.swapchains.with(swapchain, |swapchain| swapchain.desc)
    }

    fn swapchain_textures(&self, swapchain: RawSwapchainHandle) -> Result<Vec<RawTextureHandle>, GfxError> {
        self.swapchains.with(swapchain, |swapchain| swapchain.textures.clone())
    }

    fn acquire_swapchain_image(
        &self,
        swapchain: RawSwapchainHandle,
        signal_semaphore: Option<RawSemaphoreHandle>,
        timeout_ns: u64,
    ) -> (GfxResult, u32) {
        self.acquire_vk_swapchain_image(swapchain, signal_semaphore, timeout_ns)
    }

    fn present(
        &self,
        queue: QueueType,
        swapchain: RawSwapchainHandle,
        image_index: u32,
        wait_semaphores: &[RawSemaphoreHandle],
    ) -> GfxResult {
        self.present_vk(queue, swapchain, image_index, wait_semaphores)
    }
}

#[cfg(test)]
mod tests {
    use ze_gfx::descriptor::DescriptorType;

    use super::*;

    #[test]
    fn test_whole_size_matches_buffer_barrier_convention() {
        assert_eq!(vk::WHOLE_SIZE, u64::MAX);
    }

    #[test]
    fn test_descriptor_type_covers_all() {
        for ty in [
            DescriptorType::Sampler,
            DescriptorType::SampledTexture,
            DescriptorType::StorageTexture,
            DescriptorType::UniformBuffer,
            DescriptorType::StorageBuffer,
        ] {
            let vk_ty = conv::descriptor_type(ty);
            assert_ne!(vk_ty, vk::DescriptorType::INPUT_ATTACHMENT);
        }
    }
}
