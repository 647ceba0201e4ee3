//! 不依赖 GPU 的后端
//!
//! 所有资源只是计数器分配出来的整数，每一次调用都会被记录到调用日志中，供测试检查调用顺序。
//!
//! - fence 在被等待时才 signal；调用 [`HeadlessBackendDevice::set_fences_stalled`] 之后，等待会返回 `Timeout`
//! - CPU 可见的 buffer 由真实的主机内存支撑，`map_buffer` 返回可写的指针
//! - transfer 命令在录制时立即执行，便于检查上传结果

use std::{collections::HashMap, ptr::NonNull, sync::Arc};

use parking_lot::Mutex;

use crate::{
    backend::{Backend, BackendDevice, SwapchainDesc},
    commands::*,
    create_info::*,
    descriptor::{DescriptorPoolCreateInfo, DescriptorWrite},
    format::{Format, ShaderStageFlags},
    handle::*,
    result::{GfxError, GfxResult},
    types::{IndexType, MemoryUsage, PipelineBindPoint, PipelineStage, QueueType},
};

/// headless 后端模块
pub struct HeadlessBackend;

impl HeadlessBackend {
    pub const NAME: &'static str = "headless";
}

impl Backend for HeadlessBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn create_device(&self, info: &DeviceCreateInfo) -> Result<Arc<dyn BackendDevice>, GfxError> {
        log::info!("create headless backend device for {}", info.app_name);
        Ok(Arc::new(HeadlessBackendDevice::new()))
    }
}

/// 调用日志中的一项
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Create(RawResourceHandle),
    Destroy(RawResourceHandle),
    MapBuffer(RawBufferHandle),
    UnmapBuffer(RawBufferHandle),
    ResetCommandPool(RawCommandPoolHandle),
    BeginCommandList(RawCommandListHandle),
    EndCommandList(RawCommandListHandle),
    BeginRenderPass {
        list: RawCommandListHandle,
        render_pass: RawRenderPassHandle,
        color_views: Vec<RawTextureViewHandle>,
        depth_stencil_view: Option<RawTextureViewHandle>,
        width: u32,
        height: u32,
    },
    EndRenderPass(RawCommandListHandle),
    BindPipeline {
        list: RawCommandListHandle,
        pipeline: RawPipelineHandle,
    },
    BindDescriptorSets {
        list: RawCommandListHandle,
        first_set: u32,
        sets: Vec<RawDescriptorSetHandle>,
    },
    PushConstants {
        list: RawCommandListHandle,
        offset: u32,
        data: Vec<u8>,
    },
    BindVertexBuffers {
        list: RawCommandListHandle,
        buffers: Vec<RawBufferHandle>,
    },
    BindIndexBuffer {
        list: RawCommandListHandle,
        buffer: RawBufferHandle,
    },
    SetViewport(RawCommandListHandle),
    SetScissor(RawCommandListHandle, Rect2D),
    Draw {
        list: RawCommandListHandle,
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        list: RawCommandListHandle,
        index_count: u32,
        instance_count: u32,
    },
    Dispatch {
        list: RawCommandListHandle,
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        list: RawCommandListHandle,
        src: RawBufferHandle,
        dst: RawBufferHandle,
    },
    CopyBufferToTexture {
        list: RawCommandListHandle,
        src: RawBufferHandle,
        dst: RawTextureHandle,
    },
    PipelineBarrier {
        list: RawCommandListHandle,
        textures: Vec<TextureBarrier>,
        buffers: Vec<BufferBarrier>,
    },
    AllocateDescriptorSet {
        pool: RawDescriptorPoolHandle,
        set: RawDescriptorSetHandle,
    },
    ResetDescriptorPool(RawDescriptorPoolHandle),
    UpdateDescriptorSets(Vec<DescriptorWrite>),
    Submit {
        queue: QueueType,
        lists: Vec<RawCommandListHandle>,
        wait_semaphores: Vec<RawSemaphoreHandle>,
        signal_semaphores: Vec<RawSemaphoreHandle>,
        fence: Option<RawFenceHandle>,
    },
    FenceSignaled(RawFenceHandle),
    WaitForFences {
        fences: Vec<RawFenceHandle>,
        result: GfxResult,
    },
    ResetFences(Vec<RawFenceHandle>),
    AcquireImage {
        swapchain: RawSwapchainHandle,
        image_index: u32,
    },
    Present {
        swapchain: RawSwapchainHandle,
        image_index: u32,
    },
    WaitIdle,
}

impl BackendCall {
    #[inline]
    pub fn is_destroy_of(&self, handle: RawResourceHandle) -> bool {
        matches!(self, BackendCall::Destroy(h) if *h == handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    /// 已提交，等待时 signal
    Pending,
    Signaled,
}

struct HeadlessBuffer {
    memory_usage: MemoryUsage,
    data: Box<[u8]>,
}

struct HeadlessSwapchain {
    desc: SwapchainDesc,
    textures: Vec<RawTextureHandle>,
    next_image: u32,
}

#[derive(Default)]
struct HeadlessState {
    next_index: u64,
    live: HashMap<u64, DeviceResourceType>,
    buffers: HashMap<u64, HeadlessBuffer>,
    textures: HashMap<u64, TextureCreateInfo>,
    fences: HashMap<u64, FenceState>,
    swapchains: HashMap<u64, HeadlessSwapchain>,
    pool_lists: HashMap<u64, Vec<RawCommandListHandle>>,
    pool_sets: HashMap<u64, Vec<RawDescriptorSetHandle>>,
    calls: Vec<BackendCall>,
    fences_stalled: bool,
    /// 下一次创建（限定类型时只匹配该类型）返回的错误
    fail_next_create: Option<(Option<DeviceResourceType>, GfxError)>,
}

impl HeadlessState {
    fn alloc<K: ResourceKind>(&mut self) -> Result<DeviceResourceHandle<K>, GfxError> {
        if self.fail_next_create.as_ref().is_some_and(|(ty, _)| ty.is_none_or(|ty| ty == K::TYPE)) {
            if let Some((_, err)) = self.fail_next_create.take() {
                return Err(err);
            }
        }
        let index = self.next_index;
        self.next_index += 1;
        self.live.insert(index, K::TYPE);

        let handle = DeviceResourceHandle::<K>::new(index);
        self.calls.push(BackendCall::Create(handle.erase()));
        Ok(handle)
    }

    fn free<K: ResourceKind>(&mut self, handle: DeviceResourceHandle<K>) {
        match self.live.remove(&handle.index()) {
            Some(ty) => debug_assert_eq!(ty, K::TYPE, "destroying {:?} through the wrong api", handle),
            None => log::error!("headless: destroy of unknown or already destroyed {:?}", handle),
        }
        self.calls.push(BackendCall::Destroy(handle.erase()));
    }

    fn is_live<K: ResourceKind>(&self, handle: DeviceResourceHandle<K>) -> bool {
        self.live.get(&handle.index()) == Some(&K::TYPE)
    }
}

/// headless 后端设备
#[derive(Default)]
pub struct HeadlessBackendDevice {
    state: Mutex<HeadlessState>,
}

// new & init
impl HeadlessBackendDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

// 测试用的检查接口
impl HeadlessBackendDevice {
    /// 到目前为止的调用日志
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// 第一个满足条件的调用在日志中的位置
    pub fn position(&self, pred: impl Fn(&BackendCall) -> bool) -> Option<usize> {
        self.state.lock().calls.iter().position(pred)
    }

    pub fn count_calls(&self, pred: impl Fn(&BackendCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// 某一类资源当前存活的数量
    pub fn live_count(&self, ty: DeviceResourceType) -> usize {
        self.state.lock().live.values().filter(|t| **t == ty).count()
    }

    #[inline]
    pub fn is_live(&self, handle: RawResourceHandle) -> bool {
        self.state.lock().live.get(&handle.index) == Some(&handle.ty)
    }

    /// 模拟 GPU 落后：被提交的 fence 不再 signal
    pub fn set_fences_stalled(&self, stalled: bool) {
        self.state.lock().fences_stalled = stalled;
    }

    /// 下一次资源创建返回指定错误
    pub fn fail_next_create(&self, err: GfxError) {
        self.state.lock().fail_next_create = Some((None, err));
    }

    /// 下一次创建 `ty` 类型的资源时返回指定错误，其他类型不受影响
    pub fn fail_next_create_of(&self, ty: DeviceResourceType, err: GfxError) {
        self.state.lock().fail_next_create = Some((Some(ty), err));
    }

    pub fn buffer_data(&self, buffer: RawBufferHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer.index()).map(|b| b.data.to_vec())
    }
}

impl BackendDevice for HeadlessBackendDevice {
    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<RawBufferHandle, GfxError> {
        if info.size == 0 {
            return Err(GfxError::invalid_parameter("buffer size must be non-zero"));
        }
        let mut state = self.state.lock();
        let handle = state.alloc::<BufferKind>()?;
        state.buffers.insert(
            handle.index(),
            HeadlessBuffer {
                memory_usage: info.memory_usage,
                data: vec![0u8; info.size as usize].into_boxed_slice(),
            },
        );
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: RawBufferHandle) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer.index());
        state.free(buffer);
    }

    fn map_buffer(&self, buffer: RawBufferHandle) -> Result<NonNull<u8>, GfxError> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::MapBuffer(buffer));
        let buf = state
            .buffers
            .get_mut(&buffer.index())
            .ok_or_else(|| GfxError::invalid_parameter(format!("map of unknown {:?}", buffer)))?;
        if !buf.memory_usage.is_cpu_visible() {
            return Err(GfxError::invalid_parameter("mapping gpu-only memory"));
        }
        NonNull::new(buf.data.as_mut_ptr()).ok_or_else(|| GfxError::Unknown("null buffer memory".to_string()))
    }

    fn unmap_buffer(&self, buffer: RawBufferHandle) {
        self.state.lock().calls.push(BackendCall::UnmapBuffer(buffer));
    }

    fn create_texture(&self, info: &TextureCreateInfo) -> Result<RawTextureHandle, GfxError> {
        if info.width == 0 || info.height == 0 || info.depth == 0 {
            return Err(GfxError::invalid_parameter("texture extent must be non-zero"));
        }
        let mut state = self.state.lock();
        let handle = state.alloc::<TextureKind>()?;
        state.textures.insert(handle.index(), info.clone());
        Ok(handle)
    }

    fn destroy_texture(&self, texture: RawTextureHandle) {
        let mut state = self.state.lock();
        state.textures.remove(&texture.index());
        state.free(texture);
    }

    fn create_texture_view(&self, info: &TextureViewCreateInfo) -> Result<RawTextureViewHandle, GfxError> {
        let mut state = self.state.lock();
        if !state.is_live(info.texture) {
            return Err(GfxError::invalid_parameter(format!("view of unknown {:?}", info.texture)));
        }
        state.alloc::<TextureViewKind>()
    }

    fn destroy_texture_view(&self, view: RawTextureViewHandle) {
        self.state.lock().free(view);
    }

    fn create_sampler(&self, _info: &SamplerCreateInfo) -> Result<RawSamplerHandle, GfxError> {
        self.state.lock().alloc::<SamplerKind>()
    }

    fn destroy_sampler(&self, sampler: RawSamplerHandle) {
        self.state.lock().free(sampler);
    }

    fn create_shader(&self, info: &ShaderCreateInfo) -> Result<RawShaderHandle, GfxError> {
        if info.bytecode.is_empty() {
            return Err(GfxError::invalid_parameter("empty shader bytecode"));
        }
        self.state.lock().alloc::<ShaderKind>()
    }

    fn destroy_shader(&self, shader: RawShaderHandle) {
        self.state.lock().free(shader);
    }

    fn create_render_pass(&self, _info: &RenderPassCreateInfo) -> Result<RawRenderPassHandle, GfxError> {
        self.state.lock().alloc::<RenderPassKind>()
    }

    fn destroy_render_pass(&self, render_pass: RawRenderPassHandle) {
        self.state.lock().free(render_pass);
    }

    fn create_pipeline_layout(&self, _info: &PipelineLayoutCreateInfo) -> Result<RawPipelineLayoutHandle, GfxError> {
        self.state.lock().alloc::<PipelineLayoutKind>()
    }

    fn destroy_pipeline_layout(&self, layout: RawPipelineLayoutHandle) {
        self.state.lock().free(layout);
    }

    fn create_gfx_pipeline(&self, info: &GfxPipelineCreateInfo) -> Result<RawPipelineHandle, GfxError> {
        let mut state = self.state.lock();
        if info.shader_stages.iter().any(|s| !state.is_live(s.shader)) {
            return Err(GfxError::invalid_parameter("pipeline references a dead shader"));
        }
        state.alloc::<PipelineKind>()
    }

    fn create_compute_pipeline(&self, info: &ComputePipelineCreateInfo) -> Result<RawPipelineHandle, GfxError> {
        let mut state = self.state.lock();
        if !state.is_live(info.shader_stage.shader) {
            return Err(GfxError::invalid_parameter("pipeline references a dead shader"));
        }
        state.alloc::<PipelineKind>()
    }

    fn destroy_pipeline(&self, pipeline: RawPipelineHandle) {
        self.state.lock().free(pipeline);
    }

    fn create_descriptor_pool(&self, _info: &DescriptorPoolCreateInfo) -> Result<RawDescriptorPoolHandle, GfxError> {
        let mut state = self.state.lock();
        let pool = state.alloc::<DescriptorPoolKind>()?;
        state.pool_sets.insert(pool.index(), Vec::new());
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: RawDescriptorPoolHandle) {
        let mut state = self.state.lock();
        for set in state.pool_sets.remove(&pool.index()).unwrap_or_default() {
            state.live.remove(&set.index());
        }
        state.free(pool);
    }

    fn reset_descriptor_pool(&self, pool: RawDescriptorPoolHandle) -> Result<(), GfxError> {
        let mut state = self.state.lock();
        let sets = state
            .pool_sets
            .get_mut(&pool.index())
            .map(std::mem::take)
            .ok_or_else(|| GfxError::invalid_parameter(format!("reset of unknown {:?}", pool)))?;
        for set in sets {
            state.live.remove(&set.index());
        }
        state.calls.push(BackendCall::ResetDescriptorPool(pool));
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        pool: RawDescriptorPoolHandle,
        layout: RawPipelineLayoutHandle,
        _set: u32,
    ) -> Result<RawDescriptorSetHandle, GfxError> {
        let mut state = self.state.lock();
        if !state.is_live(pool) || !state.is_live(layout) {
            return Err(GfxError::invalid_parameter("descriptor set allocation from a dead pool or layout"));
        }
        let set = state.alloc::<DescriptorSetKind>()?;
        state.pool_sets.entry(pool.index()).or_default().push(set);
        state.calls.push(BackendCall::AllocateDescriptorSet { pool, set });
        Ok(set)
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        self.state.lock().calls.push(BackendCall::UpdateDescriptorSets(writes.to_vec()));
    }

    fn create_command_pool(&self, _queue: QueueType) -> Result<RawCommandPoolHandle, GfxError> {
        let mut state = self.state.lock();
        let pool = state.alloc::<CommandPoolKind>()?;
        state.pool_lists.insert(pool.index(), Vec::new());
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: RawCommandPoolHandle) {
        let mut state = self.state.lock();
        for list in state.pool_lists.remove(&pool.index()).unwrap_or_default() {
            state.live.remove(&list.index());
        }
        state.free(pool);
    }

    fn reset_command_pool(&self, pool: RawCommandPoolHandle) -> Result<(), GfxError> {
        let mut state = self.state.lock();
        if !state.is_live(pool) {
            return Err(GfxError::invalid_parameter(format!("reset of unknown {:?}", pool)));
        }
        state.calls.push(BackendCall::ResetCommandPool(pool));
        Ok(())
    }

    fn allocate_command_list(&self, pool: RawCommandPoolHandle) -> Result<RawCommandListHandle, GfxError> {
        let mut state = self.state.lock();
        if !state.is_live(pool) {
            return Err(GfxError::invalid_parameter(format!("allocation from unknown {:?}", pool)));
        }
        let list = state.alloc::<CommandListKind>()?;
        state.pool_lists.entry(pool.index()).or_default().push(list);
        Ok(list)
    }

    fn begin_command_list(&self, list: RawCommandListHandle) -> Result<(), GfxError> {
        self.state.lock().calls.push(BackendCall::BeginCommandList(list));
        Ok(())
    }

    fn end_command_list(&self, list: RawCommandListHandle) -> Result<(), GfxError> {
        self.state.lock().calls.push(BackendCall::EndCommandList(list));
        Ok(())
    }

    fn cmd_begin_render_pass(&self, list: RawCommandListHandle, info: &RenderPassBeginInfo) {
        self.state.lock().calls.push(BackendCall::BeginRenderPass {
            list,
            render_pass: info.render_pass,
            color_views: info.color_views.clone(),
            depth_stencil_view: info.depth_stencil_view,
            width: info.width,
            height: info.height,
        });
    }

    fn cmd_end_render_pass(&self, list: RawCommandListHandle) {
        self.state.lock().calls.push(BackendCall::EndRenderPass(list));
    }

    fn cmd_bind_pipeline(&self, list: RawCommandListHandle, _bind_point: PipelineBindPoint, pipeline: RawPipelineHandle) {
        self.state.lock().calls.push(BackendCall::BindPipeline { list, pipeline });
    }

    fn cmd_bind_descriptor_sets(
        &self,
        list: RawCommandListHandle,
        _bind_point: PipelineBindPoint,
        _layout: RawPipelineLayoutHandle,
        first_set: u32,
        sets: &[RawDescriptorSetHandle],
    ) {
        self.state.lock().calls.push(BackendCall::BindDescriptorSets {
            list,
            first_set,
            sets: sets.to_vec(),
        });
    }

    fn cmd_push_constants(
        &self,
        list: RawCommandListHandle,
        _layout: RawPipelineLayoutHandle,
        _stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.state.lock().calls.push(BackendCall::PushConstants {
            list,
            offset,
            data: data.to_vec(),
        });
    }

    fn cmd_bind_vertex_buffers(
        &self,
        list: RawCommandListHandle,
        _first_binding: u32,
        buffers: &[RawBufferHandle],
        _offsets: &[u64],
    ) {
        self.state.lock().calls.push(BackendCall::BindVertexBuffers {
            list,
            buffers: buffers.to_vec(),
        });
    }

    fn cmd_bind_index_buffer(&self, list: RawCommandListHandle, buffer: RawBufferHandle, _offset: u64, _ty: IndexType) {
        self.state.lock().calls.push(BackendCall::BindIndexBuffer { list, buffer });
    }

    fn cmd_set_viewport(&self, list: RawCommandListHandle, _viewport: &Viewport) {
        self.state.lock().calls.push(BackendCall::SetViewport(list));
    }

    fn cmd_set_scissor(&self, list: RawCommandListHandle, scissor: &Rect2D) {
        self.state.lock().calls.push(BackendCall::SetScissor(list, *scissor));
    }

    fn cmd_draw(
        &self,
        list: RawCommandListHandle,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.state.lock().calls.push(BackendCall::Draw {
            list,
            vertex_count,
            instance_count,
        });
    }

    fn cmd_draw_indexed(
        &self,
        list: RawCommandListHandle,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.state.lock().calls.push(BackendCall::DrawIndexed {
            list,
            index_count,
            instance_count,
        });
    }

    fn cmd_dispatch(&self, list: RawCommandListHandle, x: u32, y: u32, z: u32) {
        self.state.lock().calls.push(BackendCall::Dispatch { list, x, y, z });
    }

    fn cmd_copy_buffer(
        &self,
        list: RawCommandListHandle,
        src: RawBufferHandle,
        dst: RawBufferHandle,
        regions: &[BufferCopyRegion],
    ) {
        let mut state = self.state.lock();
        for region in regions {
            let Some(bytes) = state.buffers.get(&src.index()).and_then(|b| {
                let start = region.src_offset as usize;
                b.data.get(start..start + region.size as usize).map(|s| s.to_vec())
            }) else {
                log::error!("headless: copy source out of range");
                continue;
            };
            if let Some(dst_buf) = state.buffers.get_mut(&dst.index()) {
                let start = region.dst_offset as usize;
                if let Some(target) = dst_buf.data.get_mut(start..start + bytes.len()) {
                    target.copy_from_slice(&bytes);
                }
            }
        }
        state.calls.push(BackendCall::CopyBuffer { list, src, dst });
    }

    fn cmd_copy_buffer_to_texture(
        &self,
        list: RawCommandListHandle,
        src: RawBufferHandle,
        dst: RawTextureHandle,
        _regions: &[BufferTextureCopyRegion],
    ) {
        self.state.lock().calls.push(BackendCall::CopyBufferToTexture { list, src, dst });
    }

    fn cmd_pipeline_barrier(
        &self,
        list: RawCommandListHandle,
        texture_barriers: &[TextureBarrier],
        buffer_barriers: &[BufferBarrier],
    ) {
        self.state.lock().calls.push(BackendCall::PipelineBarrier {
            list,
            textures: texture_barriers.to_vec(),
            buffers: buffer_barriers.to_vec(),
        });
    }

    fn queue_submit(
        &self,
        queue: QueueType,
        lists: &[RawCommandListHandle],
        wait_semaphores: &[RawSemaphoreHandle],
        wait_stages: &[PipelineStage],
        signal_semaphores: &[RawSemaphoreHandle],
        fence: Option<RawFenceHandle>,
    ) -> Result<(), GfxError> {
        if wait_semaphores.len() != wait_stages.len() {
            return Err(GfxError::invalid_parameter("every wait semaphore needs a wait stage"));
        }
        let mut state = self.state.lock();
        if let Some(fence) = fence {
            match state.fences.get_mut(&fence.index()) {
                Some(fence_state) => *fence_state = FenceState::Pending,
                None => return Err(GfxError::invalid_parameter(format!("submit with unknown {:?}", fence))),
            }
        }
        state.calls.push(BackendCall::Submit {
            queue,
            lists: lists.to_vec(),
            wait_semaphores: wait_semaphores.to_vec(),
            signal_semaphores: signal_semaphores.to_vec(),
            fence,
        });
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<RawFenceHandle, GfxError> {
        let mut state = self.state.lock();
        let fence = state.alloc::<FenceKind>()?;
        let fence_state = if signaled { FenceState::Signaled } else { FenceState::Unsignaled };
        state.fences.insert(fence.index(), fence_state);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: RawFenceHandle) {
        let mut state = self.state.lock();
        state.fences.remove(&fence.index());
        state.free(fence);
    }

    fn wait_for_fences(&self, fences: &[RawFenceHandle], wait_all: bool, _timeout_ns: u64) -> GfxResult {
        let mut state = self.state.lock();
        let stalled = state.fences_stalled;

        let mut newly_signaled = Vec::new();
        let mut signaled_count = 0;
        for fence in fences {
            let Some(fence_state) = state.fences.get_mut(&fence.index()) else {
                state.calls.push(BackendCall::WaitForFences {
                    fences: fences.to_vec(),
                    result: GfxResult::ErrorInvalidParameter,
                });
                return GfxResult::ErrorInvalidParameter;
            };
            if *fence_state == FenceState::Pending && !stalled {
                *fence_state = FenceState::Signaled;
                newly_signaled.push(*fence);
            }
            if *fence_state == FenceState::Signaled {
                signaled_count += 1;
            }
        }
        for fence in newly_signaled {
            state.calls.push(BackendCall::FenceSignaled(fence));
        }

        let done = if wait_all { signaled_count == fences.len() } else { signaled_count > 0 || fences.is_empty() };
        let result = if done { GfxResult::Success } else { GfxResult::Timeout };
        state.calls.push(BackendCall::WaitForFences {
            fences: fences.to_vec(),
            result,
        });
        result
    }

    fn reset_fences(&self, fences: &[RawFenceHandle]) -> Result<(), GfxError> {
        let mut state = self.state.lock();
        for fence in fences {
            match state.fences.get_mut(&fence.index()) {
                Some(fence_state) => *fence_state = FenceState::Unsignaled,
                None => return Err(GfxError::invalid_parameter(format!("reset of unknown {:?}", fence))),
            }
        }
        state.calls.push(BackendCall::ResetFences(fences.to_vec()));
        Ok(())
    }

    fn create_semaphore(&self) -> Result<RawSemaphoreHandle, GfxError> {
        self.state.lock().alloc::<SemaphoreKind>()
    }

    fn destroy_semaphore(&self, semaphore: RawSemaphoreHandle) {
        self.state.lock().free(semaphore);
    }

    fn wait_idle(&self) -> Result<(), GfxError> {
        let mut state = self.state.lock();
        if !state.fences_stalled {
            let pending = state
                .fences
                .iter_mut()
                .filter(|(_, s)| **s == FenceState::Pending)
                .map(|(index, s)| {
                    *s = FenceState::Signaled;
                    RawFenceHandle::new(*index)
                })
                .collect::<Vec<_>>();
            for fence in pending {
                state.calls.push(BackendCall::FenceSignaled(fence));
            }
        }
        state.calls.push(BackendCall::WaitIdle);
        Ok(())
    }

    fn create_swapchain(&self, info: &SwapchainCreateInfo) -> Result<RawSwapchainHandle, GfxError> {
        if info.width == 0 || info.height == 0 {
            return Err(GfxError::invalid_parameter("swapchain extent must be non-zero"));
        }
        let format = if info.preferred_format == Format::Undefined {
            Format::B8G8R8A8Unorm
        } else {
            info.preferred_format
        };

        let mut state = self.state.lock();
        let swapchain = state.alloc::<SwapchainKind>()?;
        let mut textures = Vec::with_capacity(3);
        for _ in 0..3 {
            let texture = state.alloc::<TextureKind>()?;
            state.textures.insert(
                texture.index(),
                TextureCreateInfo::new_2d(format, info.width, info.height, crate::types::TextureUsage::COLOR_ATTACHMENT),
            );
            textures.push(texture);
        }
        state.swapchains.insert(
            swapchain.index(),
            HeadlessSwapchain {
                desc: SwapchainDesc {
                    format,
                    width: info.width,
                    height: info.height,
                    image_count: textures.len() as u32,
                },
                textures,
                next_image: 0,
            },
        );
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: RawSwapchainHandle) {
        let mut state = self.state.lock();
        if let Some(sc) = state.swapchains.remove(&swapchain.index()) {
            for texture in sc.textures {
                state.textures.remove(&texture.index());
                state.free(texture);
            }
        }
        state.free(swapchain);
    }

    fn swapchain_desc(&self, swapchain: RawSwapchainHandle) -> Result<SwapchainDesc, GfxError> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain.index())
            .map(|sc| sc.desc)
            .ok_or_else(|| GfxError::invalid_parameter(format!("unknown {:?}", swapchain)))
    }

    fn swapchain_textures(&self, swapchain: RawSwapchainHandle) -> Result<Vec<RawTextureHandle>, GfxError> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain.index())
            .map(|sc| sc.textures.clone())
            .ok_or_else(|| GfxError::invalid_parameter(format!("unknown {:?}", swapchain)))
    }

    fn acquire_swapchain_image(
        &self,
        swapchain: RawSwapchainHandle,
        _signal_semaphore: Option<RawSemaphoreHandle>,
        _timeout_ns: u64,
    ) -> (GfxResult, u32) {
        let mut state = self.state.lock();
        let Some(sc) = state.swapchains.get_mut(&swapchain.index()) else {
            return (GfxResult::ErrorInvalidParameter, 0);
        };
        let image_index = sc.next_image;
        sc.next_image = (sc.next_image + 1) % sc.desc.image_count;
        state.calls.push(BackendCall::AcquireImage { swapchain, image_index });
        (GfxResult::Success, image_index)
    }

    fn present(
        &self,
        _queue: QueueType,
        swapchain: RawSwapchainHandle,
        image_index: u32,
        _wait_semaphores: &[RawSemaphoreHandle],
    ) -> GfxResult {
        let mut state = self.state.lock();
        if !state.swapchains.contains_key(&swapchain.index()) {
            return GfxResult::ErrorInvalidParameter;
        }
        state.calls.push(BackendCall::Present { swapchain, image_index });
        GfxResult::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BufferUsage;

    fn cpu_buffer_info(size: u64) -> BufferCreateInfo {
        BufferCreateInfo {
            size,
            usage: BufferUsage::STORAGE,
            memory_usage: MemoryUsage::CpuToGpu,
            debug_name: "test".to_string(),
        }
    }

    #[test]
    fn test_fence_signals_on_wait() {
        let device = HeadlessBackendDevice::new();
        let fence = device.create_fence(false).unwrap();

        // 没有提交过的 fence 不会 signal
        assert_eq!(device.wait_for_fences(&[fence], true, 0), GfxResult::Timeout);

        device.queue_submit(QueueType::Gfx, &[], &[], &[], &[], Some(fence)).unwrap();
        assert_eq!(device.wait_for_fences(&[fence], true, u64::MAX), GfxResult::Success);
        assert!(device.position(|c| *c == BackendCall::FenceSignaled(fence)).is_some());
    }

    #[test]
    fn test_stalled_fence_times_out() {
        let device = HeadlessBackendDevice::new();
        let fence = device.create_fence(false).unwrap();
        device.queue_submit(QueueType::Gfx, &[], &[], &[], &[], Some(fence)).unwrap();

        device.set_fences_stalled(true);
        assert_eq!(device.wait_for_fences(&[fence], true, 0), GfxResult::Timeout);
        device.set_fences_stalled(false);
        assert_eq!(device.wait_for_fences(&[fence], true, 0), GfxResult::Success);
    }

    #[test]
    fn test_map_cpu_visible_buffer() {
        let device = HeadlessBackendDevice::new();
        let buffer = device.create_buffer(&cpu_buffer_info(16)).unwrap();
        let ptr = device.map_buffer(buffer).unwrap();
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xAB, 16) };
        device.unmap_buffer(buffer);
        assert_eq!(device.buffer_data(buffer).unwrap(), vec![0xAB; 16]);
    }

    #[test]
    fn test_map_gpu_only_buffer_fails() {
        let device = HeadlessBackendDevice::new();
        let buffer = device
            .create_buffer(&BufferCreateInfo {
                memory_usage: MemoryUsage::GpuOnly,
                ..cpu_buffer_info(16)
            })
            .unwrap();
        assert!(device.map_buffer(buffer).is_err());
    }

    #[test]
    fn test_fail_next_create() {
        let device = HeadlessBackendDevice::new();
        device.fail_next_create(GfxError::OutOfDeviceMemory);
        assert_eq!(device.create_buffer(&cpu_buffer_info(4)), Err(GfxError::OutOfDeviceMemory));
        assert!(device.create_buffer(&cpu_buffer_info(4)).is_ok());

        device.fail_next_create_of(DeviceResourceType::Sampler, GfxError::OutOfHostMemory);
        assert!(device.create_buffer(&cpu_buffer_info(4)).is_ok());
        assert_eq!(device.create_sampler(&SamplerCreateInfo::default()), Err(GfxError::OutOfHostMemory));
        assert!(device.create_sampler(&SamplerCreateInfo::default()).is_ok());
    }

    #[test]
    fn test_destroy_is_logged() {
        let device = HeadlessBackendDevice::new();
        let buffer = device.create_buffer(&cpu_buffer_info(4)).unwrap();
        assert_eq!(device.live_count(DeviceResourceType::Buffer), 1);
        device.destroy_buffer(buffer);
        assert_eq!(device.live_count(DeviceResourceType::Buffer), 0);
        assert!(device.calls().last().unwrap().is_destroy_of(buffer.erase()));
    }
}
