use itertools::Itertools;
use ze_device::{ColorAttachmentInfo, CommandList, DepthStencilAttachmentInfo, Device, RenderPassInfo};
use ze_gfx::types::{AttachmentLoadOp, AttachmentStoreOp, TextureLayout};

use super::{RenderGraph, RenderGraphState};
use crate::{
    attachment::AttachmentId, error::RenderGraphError, pass::PassContext, physical::PhysicalAttachment,
};

// Execute API
impl RenderGraph<'_> {
    /// 按编译得到的顺序录制所有 pass
    ///
    /// 每个 pass：先提交 barrier，再开始 render pass，调用 pass 的执行回调，最后结束 render pass。
    /// 回调返回错误时 render pass 仍然会被结束，随后返回该错误。
    pub fn execute(&mut self, device: &Device, cmd: &mut CommandList) -> Result<(), RenderGraphError> {
        let _span = tracy_client::span!("RenderGraph::execute");
        self.expect_state(RenderGraphState::Compiled)?;
        self.state = RenderGraphState::Executed;

        let order = self.pass_order.clone();
        for (position, &index) in order.iter().enumerate() {
            let _span = tracy_client::span!("render graph pass");

            let texture_barriers = self.barriers[index]
                .iter()
                .filter_map(|barrier| {
                    let texture = self.physical_of(barrier.resource)?.texture?;
                    Some(barrier.to_texture_barrier(texture))
                })
                .collect_vec();
            device.cmd_pipeline_barrier(cmd, &texture_barriers, &[])?;

            let info = self.render_pass_info(&order, position);
            device.cmd_begin_render_pass(cmd, &info)?;

            let execute = self.passes[index].execute.take();
            let result = match execute {
                Some(execute) => {
                    let mut ctx = PassContext {
                        device,
                        cmd: &mut *cmd,
                        pass_name: &self.passes[index].name,
                        names: &self.names,
                        attachments: &self.attachments,
                        physical: &self.physical,
                        extent: (info.width, info.height),
                    };
                    execute(&mut ctx)
                }
                None => Ok(()),
            };

            if cmd.is_in_render_pass() {
                device.cmd_end_render_pass(cmd)?;
            } else {
                log::warn!("pass {} ended the render pass itself", self.passes[index].name);
            }
            if let Err(e) = result {
                log::error!("pass {} failed: {}", self.passes[index].name, e);
                return Err(e.into());
            }
        }
        Ok(())
    }

    #[inline]
    fn physical_of(&self, id: AttachmentId) -> Option<&PhysicalAttachment> {
        self.physical.get(self.attachments.get(id)?.physical_index?)
    }

    /// 后面的 pass 是否还会读取该 attachment
    fn read_later(&self, order: &[usize], position: usize, id: AttachmentId) -> bool {
        order[position + 1..].iter().any(|index| self.passes[*index].reads(id))
    }

    fn render_pass_info(&self, order: &[usize], position: usize) -> RenderPassInfo {
        let pass = &self.passes[order[position]];
        let backbuffer_extent = self.backbuffer.as_ref().map(|backbuffer| (backbuffer.width, backbuffer.height));
        let last_backbuffer_writer = order
            .iter()
            .rposition(|index| self.passes[*index].writes().any(|id| Some(id) == self.backbuffer_id));

        let mut extent = None;
        let color_attachments = pass
            .color_outputs
            .iter()
            .filter_map(|output| {
                let physical = self.physical_of(output.resource)?;
                extent.get_or_insert((physical.width, physical.height));

                let is_backbuffer = Some(output.resource) == self.backbuffer_id;
                let store_op = if is_backbuffer || self.read_later(order, position, output.resource) {
                    AttachmentStoreOp::Store
                } else {
                    AttachmentStoreOp::DontCare
                };
                let initial_layout = if is_backbuffer && output.load_op != AttachmentLoadOp::Load {
                    TextureLayout::Undefined
                } else {
                    TextureLayout::ColorAttachment
                };
                let final_layout = if is_backbuffer && last_backbuffer_writer == Some(position) {
                    TextureLayout::Present
                } else {
                    TextureLayout::ColorAttachment
                };
                Some(ColorAttachmentInfo {
                    view: physical.view,
                    load_op: output.load_op,
                    store_op,
                    clear_color: output.clear_color,
                    initial_layout,
                    final_layout,
                })
            })
            .collect_vec();

        let depth_stencil_attachment = if let Some(id) = pass.depth_stencil_output {
            self.physical_of(id).map(|physical| {
                extent.get_or_insert((physical.width, physical.height));
                DepthStencilAttachmentInfo {
                    view: physical.view,
                    load_op: if pass.depth_load {
                        AttachmentLoadOp::Load
                    } else {
                        AttachmentLoadOp::Clear
                    },
                    store_op: if self.read_later(order, position, id) {
                        AttachmentStoreOp::Store
                    } else {
                        AttachmentStoreOp::DontCare
                    },
                    clear_depth: 1.0,
                    clear_stencil: 0,
                    initial_layout: TextureLayout::DepthStencilAttachment,
                    final_layout: TextureLayout::DepthStencilAttachment,
                    read_only: false,
                }
            })
        } else {
            pass.depth_stencil_input.and_then(|id| self.physical_of(id)).map(|physical| {
                extent.get_or_insert((physical.width, physical.height));
                DepthStencilAttachmentInfo {
                    view: physical.view,
                    load_op: AttachmentLoadOp::Load,
                    store_op: AttachmentStoreOp::Store,
                    clear_depth: 1.0,
                    clear_stencil: 0,
                    initial_layout: TextureLayout::DepthStencilReadOnly,
                    final_layout: TextureLayout::DepthStencilReadOnly,
                    read_only: true,
                }
            })
        };

        let (width, height) = extent.or(backbuffer_extent).unwrap_or((1, 1));
        RenderPassInfo {
            color_attachments,
            depth_stencil_attachment,
            width,
            height,
        }
    }
}

// debug
impl RenderGraph<'_> {
    /// 打印编译后的执行计划
    pub fn print_execution_plan(&self) {
        if self.state == RenderGraphState::Building {
            log::info!("render graph is not compiled yet");
            return;
        }

        log::info!("╔══════════════════════════════════════════════════════════════════╗");
        log::info!("║              RenderGraph Execution Plan                          ║");
        log::info!("╠══════════════════════════════════════════════════════════════════╣");
        log::info!(
            "║ Passes: {} / {}  |  Execution Order: [{}]",
            self.pass_order.len(),
            self.passes.len(),
            self.pass_list().join(" → ")
        );
        log::info!("╚══════════════════════════════════════════════════════════════════╝");

        let name_of = |id: AttachmentId| self.attachment_name(id).unwrap_or("<unknown>");
        for (order, &index) in self.pass_order.iter().enumerate() {
            let pass = &self.passes[index];

            log::info!("");
            log::info!("┌─────────────────────────────────────────────────────────────────┐");
            log::info!("│ [{}/{}] Pass: \"{}\"", order + 1, self.pass_order.len(), pass.name);
            log::info!("├─────────────────────────────────────────────────────────────────┤");

            for id in pass.sampled_reads() {
                log::info!("│   📖 \"{}\"", name_of(id));
            }
            for output in &pass.color_outputs {
                log::info!("│   ✏️  \"{}\" ({:?})", name_of(output.resource), output.load_op);
            }
            if let Some(id) = pass.depth_stencil_output {
                log::info!("│   ✏️  \"{}\" (depth, load: {})", name_of(id), pass.depth_load);
            }
            for barrier in &self.barriers[index] {
                log::info!(
                    "│   🚧 \"{}\" {:?} → {:?}",
                    name_of(barrier.resource),
                    barrier.old_layout,
                    barrier.new_layout
                );
            }
            log::info!("└─────────────────────────────────────────────────────────────────┘");
        }
    }
}
