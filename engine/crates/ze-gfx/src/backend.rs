use std::{collections::BTreeMap, ptr::NonNull, sync::Arc};

use crate::{
    commands::*,
    create_info::*,
    descriptor::{DescriptorPoolCreateInfo, DescriptorWrite},
    format::{Format, ShaderStageFlags},
    handle::*,
    result::{GfxError, GfxResult},
    types::{IndexType, PipelineBindPoint, PipelineStage, QueueType},
};

/// 交换链创建后的实际参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub image_count: u32,
}

/// 后端模块：按名字注册，用于创建 [`BackendDevice`]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn create_device(&self, info: &DeviceCreateInfo) -> Result<Arc<dyn BackendDevice>, GfxError>;
}

/// 唯一直接和 GPU API 打交道的接口
///
/// # 契约
/// - `create_*` 失败时返回错误，调用方需要向上传递，而不是 abort
/// - `destroy_*` 对每个成功创建的句柄只能调用一次，并且只能在 GPU 不再引用该资源之后调用。
///   这一点由 Device 的延迟销毁保证，后端自身不做检查
/// - `map_buffer` 只对 CPU 可见的内存有效
/// - `queue_submit` 不会阻塞
/// - `wait_for_fences` 会阻塞；`Timeout` 是合法的非错误结果
/// - 录制命令时，同一个 command list 同一时间只能被一个线程使用
pub trait BackendDevice: Send + Sync {
    // Buffer API
    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<RawBufferHandle, GfxError>;
    fn destroy_buffer(&self, buffer: RawBufferHandle);
    fn map_buffer(&self, buffer: RawBufferHandle) -> Result<NonNull<u8>, GfxError>;
    fn unmap_buffer(&self, buffer: RawBufferHandle);

    // Texture API
    fn create_texture(&self, info: &TextureCreateInfo) -> Result<RawTextureHandle, GfxError>;
    fn destroy_texture(&self, texture: RawTextureHandle);
    fn create_texture_view(&self, info: &TextureViewCreateInfo) -> Result<RawTextureViewHandle, GfxError>;
    fn destroy_texture_view(&self, view: RawTextureViewHandle);
    fn create_sampler(&self, info: &SamplerCreateInfo) -> Result<RawSamplerHandle, GfxError>;
    fn destroy_sampler(&self, sampler: RawSamplerHandle);

    // Pipeline API
    fn create_shader(&self, info: &ShaderCreateInfo) -> Result<RawShaderHandle, GfxError>;
    fn destroy_shader(&self, shader: RawShaderHandle);
    fn create_render_pass(&self, info: &RenderPassCreateInfo) -> Result<RawRenderPassHandle, GfxError>;
    fn destroy_render_pass(&self, render_pass: RawRenderPassHandle);
    fn create_pipeline_layout(&self, info: &PipelineLayoutCreateInfo) -> Result<RawPipelineLayoutHandle, GfxError>;
    fn destroy_pipeline_layout(&self, layout: RawPipelineLayoutHandle);
    fn create_gfx_pipeline(&self, info: &GfxPipelineCreateInfo) -> Result<RawPipelineHandle, GfxError>;
    fn create_compute_pipeline(&self, info: &ComputePipelineCreateInfo) -> Result<RawPipelineHandle, GfxError>;
    fn destroy_pipeline(&self, pipeline: RawPipelineHandle);

    // Descriptor API
    fn create_descriptor_pool(&self, info: &DescriptorPoolCreateInfo) -> Result<RawDescriptorPoolHandle, GfxError>;
    fn destroy_descriptor_pool(&self, pool: RawDescriptorPoolHandle);
    /// 池中分配出的所有 set 都会失效
    fn reset_descriptor_pool(&self, pool: RawDescriptorPoolHandle) -> Result<(), GfxError>;
    /// 按照 `layout` 中第 `set` 个 set layout 分配
    fn allocate_descriptor_set(
        &self,
        pool: RawDescriptorPoolHandle,
        layout: RawPipelineLayoutHandle,
        set: u32,
    ) -> Result<RawDescriptorSetHandle, GfxError>;
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    // Command API
    fn create_command_pool(&self, queue: QueueType) -> Result<RawCommandPoolHandle, GfxError>;
    fn destroy_command_pool(&self, pool: RawCommandPoolHandle);
    /// pool 内的 command list 回到初始状态，可以重新录制
    fn reset_command_pool(&self, pool: RawCommandPoolHandle) -> Result<(), GfxError>;
    fn allocate_command_list(&self, pool: RawCommandPoolHandle) -> Result<RawCommandListHandle, GfxError>;
    fn begin_command_list(&self, list: RawCommandListHandle) -> Result<(), GfxError>;
    fn end_command_list(&self, list: RawCommandListHandle) -> Result<(), GfxError>;

    fn cmd_begin_render_pass(&self, list: RawCommandListHandle, info: &RenderPassBeginInfo);
    fn cmd_end_render_pass(&self, list: RawCommandListHandle);
    fn cmd_bind_pipeline(&self, list: RawCommandListHandle, bind_point: PipelineBindPoint, pipeline: RawPipelineHandle);
    fn cmd_bind_descriptor_sets(
        &self,
        list: RawCommandListHandle,
        bind_point: PipelineBindPoint,
        layout: RawPipelineLayoutHandle,
        first_set: u32,
        sets: &[RawDescriptorSetHandle],
    );
    fn cmd_push_constants(
        &self,
        list: RawCommandListHandle,
        layout: RawPipelineLayoutHandle,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    fn cmd_bind_vertex_buffers(
        &self,
        list: RawCommandListHandle,
        first_binding: u32,
        buffers: &[RawBufferHandle],
        offsets: &[u64],
    );
    fn cmd_bind_index_buffer(&self, list: RawCommandListHandle, buffer: RawBufferHandle, offset: u64, ty: IndexType);
    fn cmd_set_viewport(&self, list: RawCommandListHandle, viewport: &Viewport);
    fn cmd_set_scissor(&self, list: RawCommandListHandle, scissor: &Rect2D);
    fn cmd_draw(
        &self,
        list: RawCommandListHandle,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        list: RawCommandListHandle,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, list: RawCommandListHandle, x: u32, y: u32, z: u32);
    fn cmd_copy_buffer(
        &self,
        list: RawCommandListHandle,
        src: RawBufferHandle,
        dst: RawBufferHandle,
        regions: &[BufferCopyRegion],
    );
    fn cmd_copy_buffer_to_texture(
        &self,
        list: RawCommandListHandle,
        src: RawBufferHandle,
        dst: RawTextureHandle,
        regions: &[BufferTextureCopyRegion],
    );
    fn cmd_pipeline_barrier(
        &self,
        list: RawCommandListHandle,
        texture_barriers: &[TextureBarrier],
        buffer_barriers: &[BufferBarrier],
    );

    // Queue & sync API
    #[allow(clippy::too_many_arguments)]
    fn queue_submit(
        &self,
        queue: QueueType,
        lists: &[RawCommandListHandle],
        wait_semaphores: &[RawSemaphoreHandle],
        wait_stages: &[PipelineStage],
        signal_semaphores: &[RawSemaphoreHandle],
        fence: Option<RawFenceHandle>,
    ) -> Result<(), GfxError>;
    fn create_fence(&self, signaled: bool) -> Result<RawFenceHandle, GfxError>;
    fn destroy_fence(&self, fence: RawFenceHandle);
    fn wait_for_fences(&self, fences: &[RawFenceHandle], wait_all: bool, timeout_ns: u64) -> GfxResult;
    fn reset_fences(&self, fences: &[RawFenceHandle]) -> Result<(), GfxError>;
    fn create_semaphore(&self) -> Result<RawSemaphoreHandle, GfxError>;
    fn destroy_semaphore(&self, semaphore: RawSemaphoreHandle);
    fn wait_idle(&self) -> Result<(), GfxError>;

    // Swapchain API
    fn create_swapchain(&self, info: &SwapchainCreateInfo) -> Result<RawSwapchainHandle, GfxError>;
    fn destroy_swapchain(&self, swapchain: RawSwapchainHandle);
    fn swapchain_desc(&self, swapchain: RawSwapchainHandle) -> Result<SwapchainDesc, GfxError>;
    /// 交换链的 texture 由交换链持有，不能调用 `destroy_texture`
    fn swapchain_textures(&self, swapchain: RawSwapchainHandle) -> Result<Vec<RawTextureHandle>, GfxError>;
    /// 返回值中的 image index 只在 `Success` 时有意义
    fn acquire_swapchain_image(
        &self,
        swapchain: RawSwapchainHandle,
        signal_semaphore: Option<RawSemaphoreHandle>,
        timeout_ns: u64,
    ) -> (GfxResult, u32);
    fn present(
        &self,
        queue: QueueType,
        swapchain: RawSwapchainHandle,
        image_index: u32,
        wait_semaphores: &[RawSemaphoreHandle],
    ) -> GfxResult;
}

/// 按名字查找后端
///
/// 替代动态库加载器：应用在启动时构造一次，显式传给 Device。
#[derive(Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同名的后端会被替换
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        let name = backend.name().to_string();
        if self.backends.insert(name.clone(), backend).is_some() {
            log::warn!("backend {} registered twice, the previous one is replaced", name);
        } else {
            log::info!("backend registered: {}", name);
        }
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(|name| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;

    #[test]
    fn test_registry_lookup() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(HeadlessBackend));
        assert!(registry.get(HeadlessBackend::NAME).is_some());
        assert!(registry.get("vulkangfx").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec![HeadlessBackend::NAME]);
    }

    #[test]
    fn test_create_headless_device() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(HeadlessBackend));
        let backend = registry.get(HeadlessBackend::NAME).unwrap();
        let device = backend
            .create_device(&DeviceCreateInfo {
                app_name: "test".to_string(),
                enable_validation: false,
                display_handle: None,
            })
            .unwrap();
        let fence = device.create_fence(true).unwrap();
        assert_eq!(device.wait_for_fences(&[fence], true, 0), GfxResult::Success);
        device.destroy_fence(fence);
    }
}
