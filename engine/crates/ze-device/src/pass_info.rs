use ze_gfx::{
    create_info::TextureSubresourceRange,
    types::{Access, AttachmentLoadOp, AttachmentStoreOp, PipelineStage, TextureLayout},
};

use crate::handles::{BufferHandle, TextureHandle, TextureViewHandle};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAttachmentInfo {
    pub view: TextureViewHandle,
    pub load_op: AttachmentLoadOp,
    pub store_op: AttachmentStoreOp,
    pub clear_color: [f32; 4],
    pub initial_layout: TextureLayout,
    pub final_layout: TextureLayout,
}

impl ColorAttachmentInfo {
    pub fn new(view: TextureViewHandle, load_op: AttachmentLoadOp) -> Self {
        Self {
            view,
            load_op,
            store_op: AttachmentStoreOp::Store,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            initial_layout: match load_op {
                AttachmentLoadOp::Load => TextureLayout::ColorAttachment,
                _ => TextureLayout::Undefined,
            },
            final_layout: TextureLayout::ColorAttachment,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthStencilAttachmentInfo {
    pub view: TextureViewHandle,
    pub load_op: AttachmentLoadOp,
    pub store_op: AttachmentStoreOp,
    pub clear_depth: f32,
    pub clear_stencil: u32,
    pub initial_layout: TextureLayout,
    pub final_layout: TextureLayout,
    /// 只读的 depth，可以同时被采样
    pub read_only: bool,
}

/// 开始一个 render pass 所需的信息
///
/// Device 会根据 attachment 的格式与 load/store 组合出 `RenderPassCreateInfo`，并从缓存中取得后端 render pass
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderPassInfo {
    pub color_attachments: Vec<ColorAttachmentInfo>,
    pub depth_stencil_attachment: Option<DepthStencilAttachmentInfo>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureBarrierInfo {
    pub texture: TextureHandle,
    pub src_stage: PipelineStage,
    pub src_access: Access,
    pub dst_stage: PipelineStage,
    pub dst_access: Access,
    pub old_layout: TextureLayout,
    pub new_layout: TextureLayout,
    pub range: TextureSubresourceRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferBarrierInfo {
    pub buffer: BufferHandle,
    pub src_stage: PipelineStage,
    pub src_access: Access,
    pub dst_stage: PipelineStage,
    pub dst_access: Access,
}
