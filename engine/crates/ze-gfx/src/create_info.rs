use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::{
    descriptor::{DescriptorSetLayoutDesc, PushConstantRange},
    format::{Format, ShaderStage},
    handle::{RawPipelineLayoutHandle, RawRenderPassHandle, RawShaderHandle, RawSwapchainHandle, RawTextureHandle},
    types::*,
};

/// 创建后端设备所需的信息
#[derive(Debug, Clone)]
pub struct DeviceCreateInfo {
    pub app_name: String,
    /// 是否开启验证层
    pub enable_validation: bool,
    /// 用于确定 surface 相关的 instance extension；没有窗口时为 None
    pub display_handle: Option<RawDisplayHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferCreateInfo {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory_usage: MemoryUsage,
    pub debug_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureCreateInfo {
    pub texture_type: TextureType,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: u32,
    pub usage: TextureUsage,
    pub memory_usage: MemoryUsage,
    pub debug_name: String,
}

impl TextureCreateInfo {
    pub fn new_2d(format: Format, width: u32, height: u32, usage: TextureUsage) -> Self {
        Self {
            texture_type: TextureType::Texture2D,
            format,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            usage,
            memory_usage: MemoryUsage::GpuOnly,
            debug_name: String::new(),
        }
    }

    pub fn new_cube(format: Format, size: u32, usage: TextureUsage) -> Self {
        Self {
            texture_type: TextureType::TextureCube,
            array_layers: 6,
            ..Self::new_2d(format, size, size, usage)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureSubresourceRange {
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl Default for TextureSubresourceRange {
    fn default() -> Self {
        Self {
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureViewCreateInfo {
    pub texture: RawTextureHandle,
    pub view_type: TextureViewType,
    pub format: Format,
    pub range: TextureSubresourceRange,
    pub debug_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SamplerCreateInfo {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mipmap_mode: SamplerMipmapMode,
    pub address_mode_u: SamplerAddressMode,
    pub address_mode_v: SamplerAddressMode,
    pub address_mode_w: SamplerAddressMode,
    /// 0 表示不开启各向异性过滤
    pub max_anisotropy: u8,
    pub compare_op: Option<CompareOp>,
}

impl Default for SamplerCreateInfo {
    fn default() -> Self {
        Self {
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            mipmap_mode: SamplerMipmapMode::Linear,
            address_mode_u: SamplerAddressMode::Repeat,
            address_mode_v: SamplerAddressMode::Repeat,
            address_mode_w: SamplerAddressMode::Repeat,
            max_anisotropy: 0,
            compare_op: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderCreateInfo {
    pub stage: ShaderStage,
    /// 后端相关的字节码（SPIR-V/DXIL），对核心层不透明
    pub bytecode: Vec<u8>,
    pub debug_name: String,
}

/// render pass 中的一个 attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentDesc {
    pub format: Format,
    pub samples: u32,
    pub load_op: AttachmentLoadOp,
    pub store_op: AttachmentStoreOp,
    pub stencil_load_op: AttachmentLoadOp,
    pub stencil_store_op: AttachmentStoreOp,
    pub initial_layout: TextureLayout,
    pub final_layout: TextureLayout,
}

impl AttachmentDesc {
    pub fn new(format: Format, load_op: AttachmentLoadOp, store_op: AttachmentStoreOp) -> Self {
        Self {
            format,
            samples: 1,
            load_op,
            store_op,
            stencil_load_op: AttachmentLoadOp::DontCare,
            stencil_store_op: AttachmentStoreOp::DontCare,
            initial_layout: TextureLayout::Undefined,
            final_layout: TextureLayout::Undefined,
        }
    }
}

/// 单 subpass 的 render pass
///
/// 作为 render pass cache 的 key，相等的描述只会创建一个后端对象。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RenderPassCreateInfo {
    pub color_attachments: Vec<AttachmentDesc>,
    pub depth_stencil_attachment: Option<AttachmentDesc>,
    /// depth attachment 只读，用于同时作为 shader 输入采样
    pub depth_read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PipelineLayoutCreateInfo {
    /// 按 set 序号排列
    pub set_layouts: Vec<DescriptorSetLayoutDesc>,
    pub push_constant_ranges: Vec<PushConstantRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineShaderStage {
    pub stage: ShaderStage,
    pub shader: RawShaderHandle,
    pub entry_point: String,
}

/// 图形管线的完整描述
///
/// 作为 pipeline cache 的 key：shader stage、各项状态、layout、render pass、subpass 全部参与比较。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GfxPipelineCreateInfo {
    pub shader_stages: Vec<PipelineShaderStage>,
    pub vertex_input: VertexInputState,
    pub input_assembly: InputAssemblyState,
    pub rasterizer: RasterizerState,
    pub multisample: MultisampleState,
    pub depth_stencil: DepthStencilState,
    pub color_blend: ColorBlendState,
    pub pipeline_layout: RawPipelineLayoutHandle,
    pub render_pass: RawRenderPassHandle,
    pub subpass: u32,
}

impl GfxPipelineCreateInfo {
    #[inline]
    pub fn uses_shader(&self, shader: RawShaderHandle) -> bool {
        self.shader_stages.iter().any(|s| s.shader == shader)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComputePipelineCreateInfo {
    pub shader_stage: PipelineShaderStage,
    pub pipeline_layout: RawPipelineLayoutHandle,
}

/// 窗口层只需要提供原生句柄和尺寸
#[derive(Debug, Clone, Copy)]
pub struct SwapchainCreateInfo {
    pub display_handle: RawDisplayHandle,
    pub window_handle: RawWindowHandle,
    pub width: u32,
    pub height: u32,
    pub preferred_format: Format,
    pub vsync: bool,
    pub old_swapchain: Option<RawSwapchainHandle>,
}
