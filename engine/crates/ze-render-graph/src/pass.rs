//! pass 的声明与执行上下文

use std::collections::HashMap;

use slotmap::SlotMap;
use ze_device::{CommandList, Device, DeviceError, TextureViewHandle};
use ze_gfx::types::{AttachmentLoadOp, TextureUsage};

use crate::{
    attachment::{AttachmentId, AttachmentInfo, AttachmentResource},
    physical::PhysicalAttachment,
};

pub(crate) type ExecuteFn<'a> = Box<dyn FnOnce(&mut PassContext<'_>) -> Result<(), DeviceError> + 'a>;

/// pass 写入的一个 color attachment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorOutput {
    pub resource: AttachmentId,
    /// `Load` 表示在已有内容上继续绘制
    pub load_op: AttachmentLoadOp,
    pub clear_color: [f32; 4],
}

/// 渲染图中的一个 pass
pub(crate) struct PassNode<'a> {
    pub name: String,
    pub color_outputs: Vec<ColorOutput>,
    pub attachment_inputs: Vec<AttachmentId>,
    pub depth_stencil_input: Option<AttachmentId>,
    pub depth_stencil_output: Option<AttachmentId>,
    /// 同时声明了 depth 的输入与输出
    pub depth_read_write: bool,
    /// 编译时决定：depth 输出是否保留之前的内容
    pub depth_load: bool,
    pub execute: Option<ExecuteFn<'a>>,
}

impl PassNode<'_> {
    /// 读取其他 pass 结果的 attachment：attachment input 与 depth input
    pub fn sampled_reads(&self) -> impl Iterator<Item = AttachmentId> + '_ {
        self.attachment_inputs.iter().copied().chain(self.depth_stencil_input)
    }

    /// 在已有内容上继续写的 color attachment
    pub fn loaded_outputs(&self) -> impl Iterator<Item = AttachmentId> + '_ {
        self.color_outputs
            .iter()
            .filter(|output| output.load_op == AttachmentLoadOp::Load)
            .map(|output| output.resource)
    }

    pub fn writes(&self) -> impl Iterator<Item = AttachmentId> + '_ {
        self.color_outputs.iter().map(|output| output.resource).chain(self.depth_stencil_output)
    }

    pub fn reads(&self, id: AttachmentId) -> bool {
        self.sampled_reads().chain(self.loaded_outputs()).any(|read| read == id)
    }
}

/// 在 `add_gfx_pass` 的 setup 回调中声明 pass 的 attachment
///
/// 按名字引用 attachment，第一次引用时创建。
pub struct PassBuilder<'g> {
    pub(crate) pass_index: usize,
    pub(crate) attachments: &'g mut SlotMap<AttachmentId, AttachmentResource>,
    pub(crate) names: &'g mut HashMap<String, AttachmentId>,

    pub(crate) color_outputs: Vec<ColorOutput>,
    pub(crate) attachment_inputs: Vec<AttachmentId>,
    pub(crate) depth_stencil_input: Option<AttachmentId>,
    pub(crate) depth_stencil_output: Option<AttachmentId>,
}

impl PassBuilder<'_> {
    fn attachment(&mut self, name: &str) -> AttachmentId {
        if let Some(id) = self.names.get(name) {
            return *id;
        }
        let id = self.attachments.insert(AttachmentResource::new(name));
        self.names.insert(name.to_string(), id);
        id
    }

    fn mark_write(&mut self, id: AttachmentId, usage: TextureUsage) {
        let resource = &mut self.attachments[id];
        resource.writers.insert(self.pass_index);
        resource.usage |= usage;
    }

    fn mark_read(&mut self, id: AttachmentId, usage: TextureUsage) {
        let resource = &mut self.attachments[id];
        resource.readers.insert(self.pass_index);
        resource.usage |= usage;
    }

    /// 写入 color attachment，pass 开始时清除
    pub fn add_color_output(&mut self, name: &str, info: AttachmentInfo) -> AttachmentId {
        let id = self.attachment(name);
        self.attachments[id].set_info(info);
        self.mark_write(id, TextureUsage::COLOR_ATTACHMENT);
        self.color_outputs.push(ColorOutput {
            resource: id,
            load_op: AttachmentLoadOp::Clear,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        });
        id
    }

    /// 在之前的 pass 写入的内容上继续绘制
    pub fn add_color_input_output(&mut self, name: &str) -> AttachmentId {
        let id = self.attachment(name);
        self.mark_read(id, TextureUsage::COLOR_ATTACHMENT);
        self.mark_write(id, TextureUsage::COLOR_ATTACHMENT);
        self.color_outputs.push(ColorOutput {
            resource: id,
            load_op: AttachmentLoadOp::Load,
            clear_color: [0.0; 4],
        });
        id
    }

    pub fn set_clear_color(&mut self, id: AttachmentId, clear_color: [f32; 4]) {
        match self.color_outputs.iter_mut().find(|output| output.resource == id) {
            Some(output) => output.clear_color = clear_color,
            None => log::warn!("clear color set on {:?}, which is not a color output of this pass", id),
        }
    }

    /// 在 shader 中采样之前 pass 的输出
    pub fn add_attachment_input(&mut self, name: &str) -> AttachmentId {
        let id = self.attachment(name);
        self.mark_read(id, TextureUsage::SAMPLED);
        self.attachment_inputs.push(id);
        id
    }

    pub fn set_depth_stencil_output(&mut self, name: &str, info: AttachmentInfo) -> AttachmentId {
        debug_assert!(info.format.is_depth(), "depth-stencil output {} with color format {:?}", name, info.format);
        let id = self.attachment(name);
        self.attachments[id].set_info(info);
        self.mark_write(id, TextureUsage::DEPTH_STENCIL_ATTACHMENT);
        self.depth_stencil_output = Some(id);
        id
    }

    /// 只读的 depth attachment，用于深度测试但不写入
    pub fn set_depth_stencil_input(&mut self, name: &str) -> AttachmentId {
        let id = self.attachment(name);
        self.mark_read(id, TextureUsage::DEPTH_STENCIL_ATTACHMENT);
        self.depth_stencil_input = Some(id);
        id
    }
}

/// pass 执行时的上下文
///
/// render pass 已经开始，直接录制 draw 即可。
pub struct PassContext<'c> {
    pub device: &'c Device,
    pub cmd: &'c mut CommandList,
    pub(crate) pass_name: &'c str,
    pub(crate) names: &'c HashMap<String, AttachmentId>,
    pub(crate) attachments: &'c SlotMap<AttachmentId, AttachmentResource>,
    pub(crate) physical: &'c [PhysicalAttachment],
    pub(crate) extent: (u32, u32),
}

impl PassContext<'_> {
    #[inline]
    pub fn pass_name(&self) -> &str {
        self.pass_name
    }

    /// render area 的宽高
    #[inline]
    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    pub fn physical_attachment(&self, name: &str) -> Option<PhysicalAttachment> {
        let id = self.names.get(name)?;
        let index = self.attachments.get(*id)?.physical_index?;
        self.physical.get(index).copied()
    }

    #[inline]
    pub fn texture_view(&self, name: &str) -> Option<TextureViewHandle> {
        self.physical_attachment(name).map(|physical| physical.view)
    }

    /// attachment input 的 bindless 索引，通过 push constant 传给 shader
    pub fn sampled_index(&self, name: &str) -> Option<u32> {
        let view = self.texture_view(name)?;
        self.device.texture_view_descriptor_index(view, false).map(|handle| handle.index)
    }
}
