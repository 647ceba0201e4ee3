use itertools::Itertools;
use slotmap::SecondaryMap;
use ze_device::{Device, DeviceError};
use ze_gfx::{
    DeviceResourceType,
    types::{AttachmentLoadOp, TextureLayout},
};

use super::{RenderGraph, RenderGraphState};
use crate::{
    attachment::{AttachmentId, AttachmentResource},
    barrier::GraphBarrier,
    dependency::DependencyGraph,
    error::RenderGraphError,
    physical::{PhysicalAttachment, PhysicalKey, PhysicalResourceRegistry},
};

// Compile API
impl RenderGraph<'_> {
    /// 编译渲染图
    ///
    /// 1. 检查 pass 的声明：depth 不能同时读写，读取的 attachment 必须有写入者
    /// 2. 由读写关系建立依赖图
    /// 3. 从 backbuffer 的写入者反向遍历，剔除对最终画面没有贡献的 pass
    /// 4. 拓扑排序，同时就绪的 pass 保持声明顺序
    /// 5. 按首次使用的顺序为每个 attachment 分配物理 texture
    /// 6. 沿执行顺序追踪布局，生成每个 pass 之前的 barrier
    pub fn compile(
        &mut self,
        device: &Device,
        registry: &mut PhysicalResourceRegistry,
    ) -> Result<(), RenderGraphError> {
        let _span = tracy_client::span!("RenderGraph::compile");
        self.expect_state(RenderGraphState::Building)?;

        let backbuffer_name = self.backbuffer.as_ref().ok_or(RenderGraphError::MissingBackbuffer)?.name.clone();
        if let Some(pass) = self.passes.iter().find(|pass| pass.depth_read_write) {
            return Err(RenderGraphError::DepthStencilReadWrite {
                pass: pass.name.clone(),
            });
        }
        let backbuffer_id = self
            .names
            .get(&backbuffer_name)
            .copied()
            .filter(|id| !self.attachments[*id].writers.is_empty())
            .ok_or(RenderGraphError::UnknownBackbuffer(backbuffer_name))?;
        self.validate_reads()?;

        let (producers, dependency) = self.build_dependency();
        // backbuffer 的最终内容来自最后一个写入者
        let roots = self.attachments[backbuffer_id].writers.last().copied();
        let live = producers.reachable_from(roots);
        let order = dependency.topological_sort(&live).map_err(|remaining| RenderGraphError::Cycle {
            passes: remaining.iter().map(|index| self.passes[*index].name.clone()).collect(),
        })?;

        for (index, pass) in self.passes.iter().enumerate() {
            if !live.contains(&index) {
                log::debug!("pass {} culled, nothing it writes reaches the backbuffer", pass.name);
            }
        }

        self.pass_order = order;
        self.backbuffer_id = Some(backbuffer_id);
        self.assign_physical(device, registry)?;
        self.build_barriers();
        self.dependency = Some(dependency);
        self.state = RenderGraphState::Compiled;

        log::debug!(
            "render graph compiled: [{}], {} of {} passes culled",
            self.pass_list().join(" -> "),
            self.passes.len() - self.pass_order.len(),
            self.passes.len()
        );
        Ok(())
    }

    /// 读取的 attachment（采样、depth input 以及 Load 的 color output）必须有之前声明的 pass 写入
    fn validate_reads(&self) -> Result<(), RenderGraphError> {
        for (index, pass) in self.passes.iter().enumerate() {
            for id in pass.sampled_reads().chain(pass.loaded_outputs()) {
                let resource = &self.attachments[id];
                if latest_writer_before(resource, index).is_none() {
                    return Err(RenderGraphError::ReadWithoutWriter {
                        resource: resource.name.clone(),
                        pass: pass.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// 建立两张依赖图
    ///
    /// - producers：读取者 -> 它读到的内容的写入者，即之前声明的最后一个写入者。用于剔除 pass
    /// - dependency：在 producers 之上加入写后读（之前的读取者先于新的写入者）以及写后写的顺序。用于排序
    ///
    /// 所有的边都从先声明的 pass 指向后声明的 pass。
    fn build_dependency(&self) -> (DependencyGraph, DependencyGraph) {
        let mut producers = DependencyGraph::new(self.passes.len());
        let mut dependency = DependencyGraph::new(self.passes.len());
        for (index, pass) in self.passes.iter().enumerate() {
            for id in pass.sampled_reads().chain(pass.loaded_outputs()) {
                if let Some(writer) = latest_writer_before(&self.attachments[id], index) {
                    producers.add_edge(writer, index);
                    dependency.add_edge(writer, index);
                }
            }
            for id in pass.writes() {
                let resource = &self.attachments[id];
                if let Some(writer) = latest_writer_before(resource, index) {
                    dependency.add_edge(writer, index);
                }
                for &reader in resource.readers.range(..index) {
                    dependency.add_edge(reader, index);
                }
            }
        }
        (producers, dependency)
    }

    fn assign_physical(
        &mut self,
        device: &Device,
        registry: &mut PhysicalResourceRegistry,
    ) -> Result<(), RenderGraphError> {
        let _span = tracy_client::span!("RenderGraph::assign_physical");
        let Some(backbuffer) = self.backbuffer.as_ref() else {
            return Err(RenderGraphError::MissingBackbuffer);
        };
        let frame = device.frame_id();

        let first_use = self
            .pass_order
            .iter()
            .flat_map(|index| {
                let pass = &self.passes[*index];
                pass.writes().chain(pass.sampled_reads()).map(move |id| (id, *index))
            })
            .unique_by(|(id, _)| *id)
            .collect_vec();

        let mut physical = Vec::with_capacity(first_use.len());
        for (id, pass_index) in first_use {
            let resource = &self.attachments[id];
            let attachment = if Some(id) == self.backbuffer_id {
                let format = device
                    .texture_view_format(backbuffer.view)
                    .ok_or(DeviceError::invalid_handle(DeviceResourceType::TextureView))?;
                PhysicalAttachment {
                    texture: None,
                    view: backbuffer.view,
                    format,
                    width: backbuffer.width,
                    height: backbuffer.height,
                }
            } else {
                let Some(info) = resource.info else {
                    return Err(RenderGraphError::ReadWithoutWriter {
                        resource: resource.name.clone(),
                        pass: self.passes[pass_index].name.clone(),
                    });
                };
                let (width, height) = info.size.resolve(backbuffer.width, backbuffer.height);
                let key = PhysicalKey {
                    name: resource.name.clone(),
                    format: info.format,
                    width,
                    height,
                };
                registry.acquire(device, &key, resource.usage, frame)?
            };
            physical.push((id, attachment));
        }

        self.physical = Vec::with_capacity(physical.len());
        for (id, attachment) in physical {
            self.attachments[id].physical_index = Some(self.physical.len());
            self.physical.push(attachment);
        }
        Ok(())
    }

    /// 沿执行顺序追踪每个 attachment 的布局
    ///
    /// backbuffer 的布局由 render pass 的 initial/final layout 管理，只追踪不生成 barrier
    fn build_barriers(&mut self) {
        let _span = tracy_client::span!("RenderGraph::build_barriers");
        let mut layouts = SecondaryMap::<AttachmentId, TextureLayout>::new();
        let mut barriers = vec![Vec::new(); self.passes.len()];
        let backbuffer_id = self.backbuffer_id;

        for &index in &self.pass_order {
            let pass = &mut self.passes[index];
            let pass_barriers = &mut barriers[index];

            for &id in &pass.attachment_inputs {
                track_layout(&mut layouts, pass_barriers, backbuffer_id, id, None, TextureLayout::ShaderReadOnly);
            }
            if let Some(id) = pass.depth_stencil_input {
                track_layout(&mut layouts, pass_barriers, backbuffer_id, id, None, TextureLayout::DepthStencilReadOnly);
            }
            for output in &pass.color_outputs {
                let old = match output.load_op {
                    AttachmentLoadOp::Load => None,
                    _ => Some(TextureLayout::Undefined),
                };
                track_layout(&mut layouts, pass_barriers, backbuffer_id, output.resource, old, TextureLayout::ColorAttachment);
            }
            if let Some(id) = pass.depth_stencil_output {
                // 本帧已经写过的 depth 保留内容，否则清除
                let written = layouts.get(id).is_some_and(|layout| *layout != TextureLayout::Undefined);
                pass.depth_load = written;
                let old = if written { None } else { Some(TextureLayout::Undefined) };
                track_layout(&mut layouts, pass_barriers, backbuffer_id, id, old, TextureLayout::DepthStencilAttachment);
            }
        }
        self.barriers = barriers;
    }
}

/// `index` 之前声明的最后一个写入者，也就是 `index` 读到的内容的来源
fn latest_writer_before(resource: &AttachmentResource, index: usize) -> Option<usize> {
    resource.writers.range(..index).next_back().copied()
}

/// 记录新的布局，需要转换时生成 barrier；`old` 为 None 时从追踪到的布局转换
fn track_layout(
    layouts: &mut SecondaryMap<AttachmentId, TextureLayout>,
    barriers: &mut Vec<GraphBarrier>,
    backbuffer_id: Option<AttachmentId>,
    id: AttachmentId,
    old: Option<TextureLayout>,
    new: TextureLayout,
) {
    let tracked = layouts.get(id).copied().unwrap_or(TextureLayout::Undefined);
    let old = old.unwrap_or(tracked);
    layouts.insert(id, new);
    if Some(id) != backbuffer_id && old != new {
        barriers.push(GraphBarrier::transition(id, old, new));
    }
}
