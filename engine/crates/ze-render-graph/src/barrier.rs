//! 根据 attachment 的布局转换生成 texture barrier

use ze_device::{TextureBarrierInfo, TextureHandle};
use ze_gfx::{
    create_info::TextureSubresourceRange,
    types::{Access, PipelineStage, TextureLayout},
};

use crate::attachment::AttachmentId;

/// 某个布局下访问 texture 的 stage 与 access
pub(crate) fn layout_stage_access(layout: TextureLayout) -> (PipelineStage, Access) {
    match layout {
        TextureLayout::Undefined => (PipelineStage::TOP_OF_PIPE, Access::empty()),
        TextureLayout::ColorAttachment => (
            PipelineStage::COLOR_ATTACHMENT_OUTPUT,
            Access::COLOR_ATTACHMENT_READ | Access::COLOR_ATTACHMENT_WRITE,
        ),
        TextureLayout::DepthStencilAttachment => (
            PipelineStage::EARLY_FRAGMENT_TESTS | PipelineStage::LATE_FRAGMENT_TESTS,
            Access::DEPTH_STENCIL_ATTACHMENT_READ | Access::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        TextureLayout::DepthStencilReadOnly => (
            PipelineStage::EARLY_FRAGMENT_TESTS | PipelineStage::LATE_FRAGMENT_TESTS,
            Access::DEPTH_STENCIL_ATTACHMENT_READ,
        ),
        TextureLayout::ShaderReadOnly => (PipelineStage::FRAGMENT_SHADER, Access::SHADER_READ),
        TextureLayout::TransferSrc => (PipelineStage::TRANSFER, Access::TRANSFER_READ),
        TextureLayout::TransferDst => (PipelineStage::TRANSFER, Access::TRANSFER_WRITE),
        TextureLayout::General | TextureLayout::Present => {
            (PipelineStage::ALL_COMMANDS, Access::MEMORY_READ | Access::MEMORY_WRITE)
        }
    }
}

/// pass 开始之前对一个 attachment 做的布局转换
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphBarrier {
    pub resource: AttachmentId,
    pub src_stage: PipelineStage,
    pub src_access: Access,
    pub dst_stage: PipelineStage,
    pub dst_access: Access,
    pub old_layout: TextureLayout,
    pub new_layout: TextureLayout,
}

impl GraphBarrier {
    /// stage 与 access 由两端的布局推导；源端只需要等待写操作
    pub fn transition(resource: AttachmentId, old_layout: TextureLayout, new_layout: TextureLayout) -> Self {
        let (src_stage, src_access) = layout_stage_access(old_layout);
        let (dst_stage, dst_access) = layout_stage_access(new_layout);
        let src_access = src_access
            & (Access::COLOR_ATTACHMENT_WRITE
                | Access::DEPTH_STENCIL_ATTACHMENT_WRITE
                | Access::SHADER_WRITE
                | Access::TRANSFER_WRITE
                | Access::MEMORY_WRITE);
        Self {
            resource,
            src_stage,
            src_access,
            dst_stage,
            dst_access,
            old_layout,
            new_layout,
        }
    }

    pub fn to_texture_barrier(&self, texture: TextureHandle) -> TextureBarrierInfo {
        TextureBarrierInfo {
            texture,
            src_stage: self.src_stage,
            src_access: self.src_access,
            dst_stage: self.dst_stage,
            dst_access: self.dst_access,
            old_layout: self.old_layout,
            new_layout: self.new_layout,
            range: TextureSubresourceRange::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use slotmap::SlotMap;

    use super::*;

    #[test]
    fn test_color_to_shader_read() {
        let mut ids = SlotMap::<AttachmentId, ()>::with_key();
        let id = ids.insert(());

        let barrier = GraphBarrier::transition(id, TextureLayout::ColorAttachment, TextureLayout::ShaderReadOnly);
        assert_eq!(barrier.src_stage, PipelineStage::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(barrier.src_access, Access::COLOR_ATTACHMENT_WRITE);
        assert_eq!(barrier.dst_stage, PipelineStage::FRAGMENT_SHADER);
        assert_eq!(barrier.dst_access, Access::SHADER_READ);
    }

    #[test]
    fn test_undefined_source_waits_for_nothing() {
        let mut ids = SlotMap::<AttachmentId, ()>::with_key();
        let id = ids.insert(());

        let barrier = GraphBarrier::transition(id, TextureLayout::Undefined, TextureLayout::DepthStencilAttachment);
        assert_eq!(barrier.src_access, Access::empty());
        assert!(barrier.dst_access.contains(Access::DEPTH_STENCIL_ATTACHMENT_WRITE));
    }
}
