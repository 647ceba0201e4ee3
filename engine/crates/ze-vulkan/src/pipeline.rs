use std::ffi::CString;

use ash::vk;
use itertools::Itertools;
use ze_gfx::{
    GfxError,
    create_info::{
        AttachmentDesc, ComputePipelineCreateInfo, GfxPipelineCreateInfo, PipelineLayoutCreateInfo,
        PipelineShaderStage, RenderPassCreateInfo,
    },
    descriptor::DescriptorSetLayoutDesc,
    handle::{RawRenderPassHandle, RawTextureViewHandle},
    types::TextureLayout,
};

use crate::{
    conv::{self, vk_error},
    device::{FramebufferKey, VulkanBackendDevice},
};

fn attachment_description(desc: &AttachmentDesc) -> vk::AttachmentDescription {
    vk::AttachmentDescription::default()
        .format(conv::format(desc.format))
        .samples(conv::samples(desc.samples))
        .load_op(conv::load_op(desc.load_op))
        .store_op(conv::store_op(desc.store_op))
        .stencil_load_op(conv::load_op(desc.stencil_load_op))
        .stencil_store_op(conv::store_op(desc.stencil_store_op))
        .initial_layout(conv::layout(desc.initial_layout))
        .final_layout(conv::layout(desc.final_layout))
}

// Render pass API
impl VulkanBackendDevice {
    /// 单 subpass 的 render pass，attachment 的布局转换由 render pass 完成
    pub(crate) fn create_vk_render_pass(&self, info: &RenderPassCreateInfo) -> Result<vk::RenderPass, GfxError> {
        let attachments = info
            .color_attachments
            .iter()
            .chain(info.depth_stencil_attachment.iter())
            .map(attachment_description)
            .collect_vec();

        let color_refs = (0..info.color_attachments.len() as u32)
            .map(|index| {
                vk::AttachmentReference::default()
                    .attachment(index)
                    .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            })
            .collect_vec();
        let depth_layout = if info.depth_read_only {
            TextureLayout::DepthStencilReadOnly
        } else {
            TextureLayout::DepthStencilAttachment
        };
        let depth_ref = vk::AttachmentReference::default()
            .attachment(info.color_attachments.len() as u32)
            .layout(conv::layout(depth_layout));

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if info.depth_stencil_attachment.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }

        let render_pass_ci = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass));
        unsafe { self.device.create_render_pass(&render_pass_ci, None) }.map_err(vk_error)
    }

    /// 取得缓存的 framebuffer，没有时创建
    pub(crate) fn get_or_create_framebuffer(
        &self,
        render_pass: RawRenderPassHandle,
        views: Vec<RawTextureViewHandle>,
        width: u32,
        height: u32,
    ) -> Result<vk::Framebuffer, GfxError> {
        let key = FramebufferKey {
            render_pass,
            views,
            width,
            height,
        };
        let mut framebuffers = self.framebuffers.lock();
        if let Some(framebuffer) = framebuffers.get(&key) {
            return Ok(*framebuffer);
        }

        let vk_render_pass = self.render_passes.with(render_pass, |(handle, _)| *handle)?;
        let vk_views = key
            .views
            .iter()
            .map(|view| self.texture_views.get(*view).map(|view| view.handle))
            .collect::<Result<Vec<_>, _>>()?;
        let framebuffer_ci = vk::FramebufferCreateInfo::default()
            .render_pass(vk_render_pass)
            .attachments(&vk_views)
            .width(width)
            .height(height)
            .layers(1);
        let framebuffer = unsafe { self.device.create_framebuffer(&framebuffer_ci, None) }.map_err(vk_error)?;
        log::debug!("framebuffer created for {:?}, {} attachments, {}x{}", render_pass, vk_views.len(), width, height);

        framebuffers.insert(key, framebuffer);
        Ok(framebuffer)
    }
}

// Pipeline layout API
impl VulkanBackendDevice {
    fn create_set_layout(&self, desc: &DescriptorSetLayoutDesc) -> Result<vk::DescriptorSetLayout, GfxError> {
        let bindings = desc
            .bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(conv::descriptor_type(binding.ty))
                    .descriptor_count(binding.count)
                    .stage_flags(conv::shader_stage_flags(binding.stages))
            })
            .collect_vec();
        // bindless 数组允许部分绑定，并且可以在绑定之后更新
        let binding_flags = desc
            .bindings
            .iter()
            .map(|binding| {
                if binding.bindless {
                    vk::DescriptorBindingFlags::PARTIALLY_BOUND
                        | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                        | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
                } else {
                    vk::DescriptorBindingFlags::empty()
                }
            })
            .collect_vec();
        let mut binding_flags_ci = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);

        let mut set_layout_ci = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        if desc.is_bindless() {
            set_layout_ci = set_layout_ci
                .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
                .push_next(&mut binding_flags_ci);
        }
        unsafe { self.device.create_descriptor_set_layout(&set_layout_ci, None) }.map_err(vk_error)
    }

    pub(crate) fn create_vk_pipeline_layout(
        &self,
        info: &PipelineLayoutCreateInfo,
    ) -> Result<(vk::PipelineLayout, Vec<vk::DescriptorSetLayout>), GfxError> {
        let mut set_layouts = Vec::with_capacity(info.set_layouts.len());
        for desc in &info.set_layouts {
            match self.create_set_layout(desc) {
                Ok(set_layout) => set_layouts.push(set_layout),
                Err(e) => {
                    self.destroy_set_layouts(&set_layouts);
                    return Err(e);
                }
            }
        }

        let push_constant_ranges = info
            .push_constant_ranges
            .iter()
            .map(|range| {
                vk::PushConstantRange::default()
                    .stage_flags(conv::shader_stage_flags(range.stages))
                    .offset(range.offset)
                    .size(range.size)
            })
            .collect_vec();
        let layout_ci = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        match unsafe { self.device.create_pipeline_layout(&layout_ci, None) } {
            Ok(layout) => Ok((layout, set_layouts)),
            Err(e) => {
                self.destroy_set_layouts(&set_layouts);
                Err(vk_error(e))
            }
        }
    }

    pub(crate) fn destroy_set_layouts(&self, set_layouts: &[vk::DescriptorSetLayout]) {
        for set_layout in set_layouts {
            unsafe { self.device.destroy_descriptor_set_layout(*set_layout, None) };
        }
    }
}

/// shader stage 的入口名需要在 pipeline 创建期间保持有效
struct StageInfos {
    entry_points: Vec<CString>,
    modules: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
}

impl StageInfos {
    fn new(device: &VulkanBackendDevice, stages: &[PipelineShaderStage]) -> Result<Self, GfxError> {
        let mut entry_points = Vec::with_capacity(stages.len());
        let mut modules = Vec::with_capacity(stages.len());
        for stage in stages {
            entry_points.push(
                CString::new(stage.entry_point.as_str()).map_err(|e| GfxError::invalid_parameter(e.to_string()))?,
            );
            modules.push((conv::shader_stage(stage.stage), device.shaders.get(stage.shader)?));
        }
        Ok(Self { entry_points, modules })
    }

    fn create_infos(&self) -> Vec<vk::PipelineShaderStageCreateInfo<'_>> {
        self.modules
            .iter()
            .zip(&self.entry_points)
            .map(|((stage, module), entry)| {
                vk::PipelineShaderStageCreateInfo::default().stage(*stage).module(*module).name(entry.as_c_str())
            })
            .collect_vec()
    }
}

// Pipeline API
impl VulkanBackendDevice {
    pub(crate) fn create_vk_gfx_pipeline(&self, info: &GfxPipelineCreateInfo) -> Result<vk::Pipeline, GfxError> {
        let _span = tracy_client::span!("VulkanBackendDevice::create_gfx_pipeline");

        let stages = StageInfos::new(self, &info.shader_stages)?;
        let stage_cis = stages.create_infos();
        let layout = self.pipeline_layouts.with(info.pipeline_layout, |layout| layout.handle)?;
        let render_pass = self.render_passes.with(info.render_pass, |(handle, _)| *handle)?;

        let vertex_bindings = info
            .vertex_input
            .bindings
            .iter()
            .map(|binding| {
                vk::VertexInputBindingDescription::default()
                    .binding(binding.binding)
                    .stride(binding.stride)
                    .input_rate(conv::vertex_input_rate(binding.input_rate))
            })
            .collect_vec();
        let vertex_attributes = info
            .vertex_input
            .attributes
            .iter()
            .map(|attribute| {
                vk::VertexInputAttributeDescription::default()
                    .location(attribute.location)
                    .binding(attribute.binding)
                    .format(conv::format(attribute.format))
                    .offset(attribute.offset)
            })
            .collect_vec();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(conv::topology(info.input_assembly.topology))
            .primitive_restart_enable(info.input_assembly.primitive_restart);

        // viewport 与 scissor 使用 dynamic state
        let viewport_state = vk::PipelineViewportStateCreateInfo::default().viewport_count(1).scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(conv::polygon_mode(info.rasterizer.polygon_mode))
            .cull_mode(conv::cull_mode(info.rasterizer.cull_mode))
            .front_face(conv::front_face(info.rasterizer.front_face))
            .depth_clamp_enable(info.rasterizer.depth_clamp)
            .line_width(1.0);
        let multisample =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(conv::samples(info.multisample.samples));
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(info.depth_stencil.depth_test)
            .depth_write_enable(info.depth_stencil.depth_write)
            .depth_compare_op(conv::compare_op(info.depth_stencil.depth_compare_op));

        let blend_attachments = info
            .color_blend
            .attachments
            .iter()
            .map(|state| {
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(state.blend_enable)
                    .src_color_blend_factor(conv::blend_factor(state.src_color_blend_factor))
                    .dst_color_blend_factor(conv::blend_factor(state.dst_color_blend_factor))
                    .color_blend_op(conv::blend_op(state.color_blend_op))
                    .src_alpha_blend_factor(conv::blend_factor(state.src_alpha_blend_factor))
                    .dst_alpha_blend_factor(conv::blend_factor(state.dst_alpha_blend_factor))
                    .alpha_blend_op(conv::blend_op(state.alpha_blend_op))
                    .color_write_mask(conv::color_write_mask(state.color_write_mask))
            })
            .collect_vec();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let pipeline_ci = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_cis)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(info.subpass);

        let pipelines = unsafe {
            self.device.create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&pipeline_ci), None)
        }
        .map_err(|(_, e)| vk_error(e))?;
        pipelines.first().copied().ok_or_else(|| GfxError::Unknown("no graphics pipeline returned".to_string()))
    }

    pub(crate) fn create_vk_compute_pipeline(&self, info: &ComputePipelineCreateInfo) -> Result<vk::Pipeline, GfxError> {
        let stages = StageInfos::new(self, std::slice::from_ref(&info.shader_stage))?;
        let stage_cis = stages.create_infos();
        let stage_ci = stage_cis.first().copied().ok_or_else(|| GfxError::invalid_parameter("missing compute stage"))?;
        let layout = self.pipeline_layouts.with(info.pipeline_layout, |layout| layout.handle)?;

        let pipeline_ci = vk::ComputePipelineCreateInfo::default().stage(stage_ci).layout(layout);
        let pipelines = unsafe {
            self.device.create_compute_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&pipeline_ci), None)
        }
        .map_err(|(_, e)| vk_error(e))?;
        pipelines.first().copied().ok_or_else(|| GfxError::Unknown("no compute pipeline returned".to_string()))
    }
}
