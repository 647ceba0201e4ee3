use crate::{
    create_info::TextureSubresourceRange,
    handle::{RawBufferHandle, RawRenderPassHandle, RawTextureHandle, RawTextureViewHandle},
    types::{Access, PipelineStage, TextureLayout},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect2D {
    #[inline]
    pub fn from_extent(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

/// 后端 render pass 的开始参数
///
/// framebuffer 由后端根据 render pass 与 attachment view 自行管理。
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassBeginInfo {
    pub render_pass: RawRenderPassHandle,
    pub color_views: Vec<RawTextureViewHandle>,
    pub depth_stencil_view: Option<RawTextureViewHandle>,
    pub width: u32,
    pub height: u32,
    /// 与 attachment 一一对应，depth 在最后
    pub clear_values: Vec<ClearValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureBarrier {
    pub texture: RawTextureHandle,
    pub src_stage: PipelineStage,
    pub src_access: Access,
    pub dst_stage: PipelineStage,
    pub dst_access: Access,
    pub old_layout: TextureLayout,
    pub new_layout: TextureLayout,
    pub range: TextureSubresourceRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferBarrier {
    pub buffer: RawBufferHandle,
    pub src_stage: PipelineStage,
    pub src_access: Access,
    pub dst_stage: PipelineStage,
    pub dst_access: Access,
    pub offset: u64,
    /// `u64::MAX` 表示整个 buffer
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferCopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferTextureCopyRegion {
    pub buffer_offset: u64,
    pub mip_level: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}
