use std::collections::BTreeMap;

use ze_gfx::{
    ShaderStage,
    handle::{RawCommandListHandle, RawPipelineHandle, RawPipelineLayoutHandle, RawRenderPassHandle},
    types::*,
};

use crate::{
    error::DeviceError,
    handles::{BufferHandle, PipelineLayoutHandle, SamplerHandle, ShaderHandle, TextureViewHandle},
};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirtyFlags: u32 {
        /// 图形管线需要重新解析
        const GFX_PIPELINE = 1 << 0;
        const COMPUTE_PIPELINE = 1 << 1;
    }
}

/// 非 bindless 的 descriptor，绑定在 set 1 及以上
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Descriptor {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    TextureView {
        view: TextureViewHandle,
        layout: TextureLayout,
    },
    Sampler(SamplerHandle),
}

/// 每个 set 的 descriptor 以及脏标记
///
/// 脏标记按 bind point 分开记录，图形和计算各自在 draw/dispatch 前重新分配 descriptor set
#[derive(Debug, Default)]
pub struct DescriptorTable {
    sets: BTreeMap<u32, BTreeMap<u32, Descriptor>>,
    dirty_sets: [u32; 2],
}

impl DescriptorTable {
    const SETS: std::ops::Range<u32> = 1..32;

    #[inline]
    fn bind_point_index(bind_point: PipelineBindPoint) -> usize {
        match bind_point {
            PipelineBindPoint::Graphics => 0,
            PipelineBindPoint::Compute => 1,
        }
    }

    /// set 0 留给 bindless，可用的 set 为 `1..32`
    pub fn set(&mut self, set: u32, binding: u32, descriptor: Descriptor) -> Result<(), DeviceError> {
        if !Self::SETS.contains(&set) {
            log::error!("descriptor bound to set {}, which is reserved or out of range", set);
            return Err(DeviceError::InvalidDescriptorSet { set });
        }
        let bindings = self.sets.entry(set).or_default();
        if bindings.get(&binding) == Some(&descriptor) {
            return Ok(());
        }
        bindings.insert(binding, descriptor);
        for dirty in &mut self.dirty_sets {
            *dirty |= 1 << set;
        }
        Ok(())
    }

    #[inline]
    pub fn bindings(&self, set: u32) -> Option<&BTreeMap<u32, Descriptor>> {
        self.sets.get(&set)
    }

    /// 所有已写入的 set 都标记为脏，pipeline layout 变化时使用
    pub fn mark_all_dirty(&mut self, bind_point: PipelineBindPoint) {
        let mask = self.sets.keys().fold(0u32, |mask, set| mask | (1 << set));
        self.dirty_sets[Self::bind_point_index(bind_point)] |= mask;
    }

    /// 取出脏的 set 序号，并清除对应的脏标记
    pub fn take_dirty_sets(&mut self, bind_point: PipelineBindPoint) -> Vec<u32> {
        let dirty = std::mem::take(&mut self.dirty_sets[Self::bind_point_index(bind_point)]);
        (0..32).filter(|set| dirty & (1 << set) != 0).collect()
    }

    #[inline]
    pub fn is_dirty(&self, bind_point: PipelineBindPoint) -> bool {
        self.dirty_sets[Self::bind_point_index(bind_point)] != 0
    }
}

/// 图形管线的状态缓存，draw 时组合成 `GfxPipelineCreateInfo`
#[derive(Debug, Clone, Default)]
pub struct GraphicsState {
    pub shader_stages: BTreeMap<ShaderStage, (ShaderHandle, String)>,
    pub vertex_input: VertexInputState,
    pub input_assembly: InputAssemblyState,
    pub rasterizer: RasterizerState,
    pub multisample: MultisampleState,
    pub depth_stencil: DepthStencilState,
    pub color_blend: ColorBlendState,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ActiveRenderPass {
    pub raw: RawRenderPassHandle,
    pub color_count: usize,
}

/// 正在录制的 command list
///
/// 由 `Device::allocate_command_list` 创建，通过 `Device::submit` 交还。
/// 只记录状态，真正的 pipeline 对象在下一次 draw/dispatch 时才解析。
pub struct CommandList {
    pub(crate) raw: RawCommandListHandle,
    pub(crate) queue: QueueType,
    pub(crate) frame_index: usize,
    pub(crate) epoch: u64,

    pub(crate) gfx: GraphicsState,
    pub(crate) compute_shader: Option<(ShaderHandle, String)>,
    pub(crate) pipeline_layout: Option<PipelineLayoutHandle>,
    pub(crate) render_pass: Option<ActiveRenderPass>,
    pub(crate) dirty: DirtyFlags,
    pub(crate) descriptors: DescriptorTable,

    /// 已经绑定到后端的 pipeline，下标为 bind point
    pub(crate) bound_pipelines: [Option<RawPipelineHandle>; 2],
    /// 已经绑定了 bindless set 的 layout
    pub(crate) bindless_layouts: [Option<RawPipelineLayoutHandle>; 2],
}

// new & init
impl CommandList {
    pub(crate) fn new(raw: RawCommandListHandle, queue: QueueType, frame_index: usize, epoch: u64) -> Self {
        Self {
            raw,
            queue,
            frame_index,
            epoch,
            gfx: GraphicsState::default(),
            compute_shader: None,
            pipeline_layout: None,
            render_pass: None,
            dirty: DirtyFlags::all(),
            descriptors: DescriptorTable::default(),
            bound_pipelines: [None; 2],
            bindless_layouts: [None; 2],
        }
    }
}

// getters
impl CommandList {
    #[inline]
    pub fn raw(&self) -> RawCommandListHandle {
        self.raw
    }

    #[inline]
    pub fn queue(&self) -> QueueType {
        self.queue
    }

    /// 录制时所在的帧
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[inline]
    pub fn is_in_render_pass(&self) -> bool {
        self.render_pass.is_some()
    }

    #[inline]
    pub fn pipeline_layout(&self) -> Option<PipelineLayoutHandle> {
        self.pipeline_layout
    }

    #[inline]
    pub fn graphics_state(&self) -> &GraphicsState {
        &self.gfx
    }

    #[inline]
    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }
}

// state
impl CommandList {
    pub(crate) fn set_shader(&mut self, stage: ShaderStage, shader: ShaderHandle, entry_point: &str) {
        let value = (shader, entry_point.to_string());
        if stage == ShaderStage::Compute {
            if self.compute_shader.as_ref() != Some(&value) {
                self.compute_shader = Some(value);
                self.dirty |= DirtyFlags::COMPUTE_PIPELINE;
            }
            return;
        }
        if self.gfx.shader_stages.get(&stage) != Some(&value) {
            self.gfx.shader_stages.insert(stage, value);
            self.dirty |= DirtyFlags::GFX_PIPELINE;
        }
    }

    pub(crate) fn set_pipeline_layout(&mut self, layout: PipelineLayoutHandle) {
        if self.pipeline_layout != Some(layout) {
            self.pipeline_layout = Some(layout);
            self.dirty |= DirtyFlags::all();
            self.descriptors.mark_all_dirty(PipelineBindPoint::Graphics);
            self.descriptors.mark_all_dirty(PipelineBindPoint::Compute);
        }
    }

    /// 修改图形状态，只有真正变化时才标记脏
    pub(crate) fn update_gfx_state(&mut self, f: impl FnOnce(&mut GraphicsState)) {
        let mut state = self.gfx.clone();
        f(&mut state);
        if !gfx_state_eq(&state, &self.gfx) {
            self.gfx = state;
            self.dirty |= DirtyFlags::GFX_PIPELINE;
        }
    }

    pub(crate) fn begin_render_pass(&mut self, raw: RawRenderPassHandle, color_count: usize) {
        if self.render_pass.map(|rp| rp.raw) != Some(raw) {
            self.dirty |= DirtyFlags::GFX_PIPELINE;
        }
        self.render_pass = Some(ActiveRenderPass { raw, color_count });
    }

    pub(crate) fn end_render_pass(&mut self) -> bool {
        self.render_pass.take().is_some()
    }
}

fn gfx_state_eq(a: &GraphicsState, b: &GraphicsState) -> bool {
    a.shader_stages == b.shader_stages
        && a.vertex_input == b.vertex_input
        && a.input_assembly == b.input_assembly
        && a.rasterizer == b.rasterizer
        && a.multisample == b.multisample
        && a.depth_stencil == b.depth_stencil
        && a.color_blend == b.color_blend
}

#[cfg(test)]
mod tests {
    use slotmap::SlotMap;

    use super::*;

    fn new_list() -> CommandList {
        let mut list = CommandList::new(RawCommandListHandle::new(1), QueueType::Gfx, 0, 0);
        list.dirty = DirtyFlags::empty();
        list
    }

    #[test]
    fn test_unchanged_state_stays_clean() {
        let mut list = new_list();
        list.update_gfx_state(|s| s.rasterizer = RasterizerState::default());
        assert!(list.dirty().is_empty());

        list.update_gfx_state(|s| s.depth_stencil.depth_test = true);
        assert!(list.dirty().contains(DirtyFlags::GFX_PIPELINE));
    }

    #[test]
    fn test_shader_binding_marks_dirty() {
        let mut shaders = SlotMap::<ShaderHandle, ()>::with_key();
        let vs = shaders.insert(());
        let cs = shaders.insert(());

        let mut list = new_list();
        list.set_shader(ShaderStage::Vertex, vs, "main");
        assert_eq!(list.dirty(), DirtyFlags::GFX_PIPELINE);

        list.dirty = DirtyFlags::empty();
        list.set_shader(ShaderStage::Vertex, vs, "main");
        assert!(list.dirty().is_empty());

        list.set_shader(ShaderStage::Compute, cs, "main");
        assert_eq!(list.dirty(), DirtyFlags::COMPUTE_PIPELINE);
    }

    #[test]
    fn test_descriptor_table_dirty_sets() {
        let mut samplers = SlotMap::<SamplerHandle, ()>::with_key();
        let sampler = samplers.insert(());

        let mut table = DescriptorTable::default();
        table.set(1, 0, Descriptor::Sampler(sampler)).unwrap();
        table.set(3, 2, Descriptor::Sampler(sampler)).unwrap();

        assert_eq!(table.take_dirty_sets(PipelineBindPoint::Graphics), vec![1, 3]);
        assert!(table.take_dirty_sets(PipelineBindPoint::Graphics).is_empty());
        // 计算管线的标记独立
        assert!(table.is_dirty(PipelineBindPoint::Compute));

        // 写入相同的值不会标脏
        table.set(1, 0, Descriptor::Sampler(sampler)).unwrap();
        assert!(!table.is_dirty(PipelineBindPoint::Graphics));

        table.mark_all_dirty(PipelineBindPoint::Graphics);
        assert_eq!(table.take_dirty_sets(PipelineBindPoint::Graphics), vec![1, 3]);
        assert_eq!(table.bindings(3).map(|b| b.len()), Some(1));
    }

    #[test]
    fn test_descriptor_set_range_checked() {
        let mut samplers = SlotMap::<SamplerHandle, ()>::with_key();
        let sampler = samplers.insert(());

        let mut table = DescriptorTable::default();
        for set in [0, 32, u32::MAX] {
            assert!(matches!(
                table.set(set, 0, Descriptor::Sampler(sampler)),
                Err(DeviceError::InvalidDescriptorSet { set: s }) if s == set
            ));
        }
        assert!(!table.is_dirty(PipelineBindPoint::Graphics));
        table.set(31, 0, Descriptor::Sampler(sampler)).unwrap();
        assert_eq!(table.take_dirty_sets(PipelineBindPoint::Graphics), vec![31]);
    }
}
