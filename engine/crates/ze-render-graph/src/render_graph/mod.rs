mod compile;
mod execute;

#[cfg(test)]
mod tests;

use std::collections::HashMap;

use slotmap::SlotMap;
use ze_device::{DeviceError, TextureViewHandle};

use crate::{
    attachment::{AttachmentId, AttachmentResource},
    barrier::GraphBarrier,
    dependency::DependencyGraph,
    error::RenderGraphError,
    pass::{PassBuilder, PassContext, PassNode},
    physical::PhysicalAttachment,
};

/// 渲染图的生命周期，只能按顺序前进
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderGraphState {
    #[default]
    Building,
    Compiled,
    Executed,
}

struct Backbuffer {
    name: String,
    view: TextureViewHandle,
    width: u32,
    height: u32,
}

/// 一帧的渲染图
///
/// 构建、编译、执行各一次，之后丢弃。`'a` 是 pass 执行回调可以借用的外部数据的生命周期。
///
/// 依赖由 attachment 的读写推导：
/// - 采样某个 attachment（attachment input / depth input）的 pass 依赖所有写入它的 pass
/// - 在已有内容上继续绘制的 pass 依赖声明在它之前的写入者
/// - 多个 pass 写入同一个 attachment 时，按声明顺序先后执行
pub struct RenderGraph<'a> {
    state: RenderGraphState,

    attachments: SlotMap<AttachmentId, AttachmentResource>,
    names: HashMap<String, AttachmentId>,
    /// 按声明顺序
    passes: Vec<PassNode<'a>>,
    backbuffer: Option<Backbuffer>,

    // 编译结果
    pass_order: Vec<usize>,
    /// 按 pass 的声明序号
    barriers: Vec<Vec<GraphBarrier>>,
    physical: Vec<PhysicalAttachment>,
    backbuffer_id: Option<AttachmentId>,
    dependency: Option<DependencyGraph>,
}

impl Default for RenderGraph<'_> {
    fn default() -> Self {
        Self::new()
    }
}

// new & init
impl<'a> RenderGraph<'a> {
    pub fn new() -> Self {
        Self {
            state: RenderGraphState::Building,
            attachments: SlotMap::with_key(),
            names: HashMap::new(),
            passes: Vec::new(),
            backbuffer: None,
            pass_order: Vec::new(),
            barriers: Vec::new(),
            physical: Vec::new(),
            backbuffer_id: None,
            dependency: None,
        }
    }

    /// 添加一个图形 pass
    ///
    /// `setup` 立即执行，用来声明 pass 读写的 attachment；`execute` 保存下来，在 `execute` 阶段按顺序调用。
    /// 被剔除的 pass 的 `execute` 不会被调用。
    pub fn add_gfx_pass(
        &mut self,
        name: &str,
        setup: impl FnOnce(&mut PassBuilder),
        execute: impl FnOnce(&mut PassContext<'_>) -> Result<(), DeviceError> + 'a,
    ) -> &mut Self {
        if self.state != RenderGraphState::Building {
            log::error!("pass {} added to a {:?} render graph, ignored", name, self.state);
            return self;
        }
        if self.passes.iter().any(|pass| pass.name == name) {
            log::warn!("render graph already has a pass named {}", name);
        }

        let mut builder = PassBuilder {
            pass_index: self.passes.len(),
            attachments: &mut self.attachments,
            names: &mut self.names,
            color_outputs: Vec::new(),
            attachment_inputs: Vec::new(),
            depth_stencil_input: None,
            depth_stencil_output: None,
        };
        setup(&mut builder);

        let depth_read_write = builder.depth_stencil_input.is_some() && builder.depth_stencil_output.is_some();
        self.passes.push(PassNode {
            name: name.to_string(),
            color_outputs: builder.color_outputs,
            attachment_inputs: builder.attachment_inputs,
            depth_stencil_input: builder.depth_stencil_input,
            depth_stencil_output: builder.depth_stencil_output,
            depth_read_write,
            depth_load: false,
            execute: Some(Box::new(execute)),
        });
        self
    }

    /// 指定真正的交换链图像，`compile` 之前必须调用
    ///
    /// 只有最终写入它的 pass 链会被保留。它的布局由 present 流程管理，渲染图不会为它插入 barrier。
    pub fn set_backbuffer_attachment(&mut self, name: &str, view: TextureViewHandle, width: u32, height: u32) {
        if self.state != RenderGraphState::Building {
            log::error!("backbuffer set on a {:?} render graph, ignored", self.state);
            return;
        }
        self.backbuffer = Some(Backbuffer {
            name: name.to_string(),
            view,
            width,
            height,
        });
    }
}

// getters
impl RenderGraph<'_> {
    #[inline]
    pub fn state(&self) -> RenderGraphState {
        self.state
    }

    #[inline]
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// 编译后按执行顺序排列的 pass 名字
    pub fn pass_list(&self) -> Vec<&str> {
        self.pass_order.iter().map(|index| self.passes[*index].name.as_str()).collect()
    }

    /// 编译后某个 pass 开始前的 barrier；pass 不存在或被剔除时返回 None
    pub fn barriers_for(&self, pass: &str) -> Option<&[GraphBarrier]> {
        let index = self.pass_index(pass)?;
        if !self.pass_order.contains(&index) {
            return None;
        }
        self.barriers.get(index).map(Vec::as_slice)
    }

    #[inline]
    pub fn attachment(&self, name: &str) -> Option<&AttachmentResource> {
        self.attachments.get(*self.names.get(name)?)
    }

    #[inline]
    pub fn attachment_name(&self, id: AttachmentId) -> Option<&str> {
        self.attachments.get(id).map(|resource| resource.name.as_str())
    }

    pub fn physical_attachment(&self, name: &str) -> Option<PhysicalAttachment> {
        let index = self.attachment(name)?.physical_index?;
        self.physical.get(index).copied()
    }

    /// 编译后的依赖图
    #[inline]
    pub fn dependency_graph(&self) -> Option<&DependencyGraph> {
        self.dependency.as_ref()
    }

    #[inline]
    fn pass_index(&self, name: &str) -> Option<usize> {
        self.passes.iter().position(|pass| pass.name == name)
    }
}

// tools
impl RenderGraph<'_> {
    fn expect_state(&self, expected: RenderGraphState) -> Result<(), RenderGraphError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RenderGraphError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }
}
