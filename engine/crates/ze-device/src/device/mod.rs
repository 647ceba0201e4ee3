mod commands;
mod frame;
mod resources;


use std::{collections::HashMap, sync::Arc};

use itertools::Itertools;
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;
use ze_gfx::{
    BackendDevice, BackendRegistry, Format,
    create_info::{
        BufferCreateInfo as GfxBufferCreateInfo, DeviceCreateInfo, SamplerCreateInfo,
        TextureCreateInfo as GfxTextureCreateInfo, TextureSubresourceRange, TextureViewCreateInfo as GfxViewCreateInfo,
    },
    handle::*,
    types::*,
};

use crate::{
    bindless::{DescriptorIndexHandle, DescriptorIndexManager, DummyDescriptors},
    error::DeviceError,
    frame::{Frame, FrameCounter},
    handles::*,
    pipeline_cache::PipelineCache,
    resource_pool::ResourcePool,
    resources::*,
    retirement::RetirementQueue,
    settings::DeviceSettings,
};

/// 逻辑上已经销毁、等待 GPU 完成后才真正释放的资源
#[derive(Debug, Clone, Copy)]
pub(crate) enum RetiredResource {
    Buffer(BufferHandle),
    Texture(TextureHandle),
    TextureView(TextureViewHandle),
    Sampler(SamplerHandle),
    Shader(ShaderHandle),
    PipelineLayout(PipelineLayoutHandle),
    Swapchain(SwapchainHandle),
    Fence(FenceHandle),
    Semaphore(SemaphoreHandle),
    /// 上传用的 staging buffer，不在资源池中
    StagingBuffer(RawBufferHandle),
    /// 从 pipeline cache 中移除的 pipeline
    Pipeline(RawPipelineHandle),
    DescriptorIndex(DescriptorIndexHandle),
}

/// 开启 debug 验证时，bindless 槽位释放后指向的占位资源
struct DummyResources {
    buffer: RawBufferHandle,
    textures: Vec<RawTextureHandle>,
    views: Vec<RawTextureViewHandle>,
    sampler: RawSamplerHandle,
    descriptors: DummyDescriptors,
}

impl DummyResources {
    fn new(backend: &dyn BackendDevice) -> Result<Self, DeviceError> {
        let buffer = backend.create_buffer(&GfxBufferCreateInfo {
            size: 16,
            usage: BufferUsage::STORAGE | BufferUsage::UNORDERED_ACCESS,
            memory_usage: MemoryUsage::CpuToGpu,
            debug_name: "dummy-buffer".to_string(),
        })?;

        let mut textures = Vec::new();
        let mut views = Vec::new();
        let mut create_view = |info: GfxTextureCreateInfo, view_type: TextureViewType| -> Result<RawTextureViewHandle, DeviceError> {
            let layer_count = info.array_layers;
            let format = info.format;
            let texture = backend.create_texture(&info)?;
            textures.push(texture);
            let view = backend.create_texture_view(&GfxViewCreateInfo {
                texture,
                view_type,
                format,
                range: TextureSubresourceRange {
                    layer_count,
                    ..Default::default()
                },
                debug_name: format!("{}-view", info.debug_name),
            })?;
            views.push(view);
            Ok(view)
        };

        let texture_2d = create_view(
            GfxTextureCreateInfo {
                debug_name: "dummy-texture-2d".to_string(),
                ..GfxTextureCreateInfo::new_2d(Format::R8G8B8A8Unorm, 1, 1, TextureUsage::SAMPLED)
            },
            TextureViewType::View2D,
        )?;
        let storage_2d = create_view(
            GfxTextureCreateInfo {
                debug_name: "dummy-storage-2d".to_string(),
                ..GfxTextureCreateInfo::new_2d(Format::R8G8B8A8Unorm, 1, 1, TextureUsage::STORAGE)
            },
            TextureViewType::View2D,
        )?;
        let texture_cube = create_view(
            GfxTextureCreateInfo {
                debug_name: "dummy-texture-cube".to_string(),
                ..GfxTextureCreateInfo::new_cube(Format::R8G8B8A8Unorm, 1, TextureUsage::SAMPLED)
            },
            TextureViewType::ViewCube,
        )?;
        let sampler = backend.create_sampler(&SamplerCreateInfo::default())?;

        Ok(Self {
            buffer,
            textures,
            views,
            sampler,
            descriptors: DummyDescriptors {
                buffer,
                texture_2d,
                storage_2d,
                texture_cube,
                sampler,
            },
        })
    }

    fn destroy(&self, backend: &dyn BackendDevice) {
        backend.destroy_sampler(self.sampler);
        for view in &self.views {
            backend.destroy_texture_view(*view);
        }
        for texture in &self.textures {
            backend.destroy_texture(*texture);
        }
        backend.destroy_buffer(self.buffer);
    }
}

/// 高层设备
///
/// 持有所有资源池、帧 ring buffer、pipeline 缓存和 bindless 管理器，是引擎录制命令和管理资源的唯一入口。
/// 所有方法都只需要 `&self`，可以在多个线程间共享。
///
/// # 延迟销毁
/// `destroy_*` 只是把资源按当前帧号放入回收队列；`new_frame` 等待复用的帧的 fence 之后，
/// 才会真正释放 `max_frames_in_flight` 帧之前退休的资源。在此之前句柄仍然有效。
pub struct Device {
    backend: Arc<dyn BackendDevice>,
    settings: DeviceSettings,

    buffers: ResourcePool<BufferHandle, BufferEntry>,
    textures: ResourcePool<TextureHandle, TextureEntry>,
    texture_views: ResourcePool<TextureViewHandle, TextureViewEntry>,
    samplers: ResourcePool<SamplerHandle, SamplerEntry>,
    shaders: ResourcePool<ShaderHandle, ShaderEntry>,
    pipeline_layouts: ResourcePool<PipelineLayoutHandle, PipelineLayoutEntry>,
    swapchains: ResourcePool<SwapchainHandle, SwapchainEntry>,
    fences: ResourcePool<FenceHandle, SyncEntry<RawFenceHandle>>,
    semaphores: ResourcePool<SemaphoreHandle, SyncEntry<RawSemaphoreHandle>>,

    sampler_cache: Mutex<HashMap<SamplerCreateInfo, SamplerHandle>>,
    retired: Mutex<RetirementQueue<RetiredResource>>,

    frames: Vec<Frame>,
    frame_counter: Mutex<FrameCounter>,

    pipeline_cache: PipelineCache,
    bindless: DescriptorIndexManager,
    dummy: Option<DummyResources>,
}

// new & init
impl Device {
    /// 按 `settings.backend` 从注册表中选择后端并创建设备
    ///
    /// 需要创建交换链时传入窗口的 display handle，用于开启 surface 相关的扩展
    pub fn new(
        registry: &BackendRegistry,
        settings: DeviceSettings,
        display_handle: Option<RawDisplayHandle>,
    ) -> Result<Self, DeviceError> {
        let settings = settings.sanitized();
        let backend =
            registry.get(&settings.backend).ok_or_else(|| DeviceError::UnknownBackend(settings.backend.clone()))?;
        log::info!("using backend: {}", backend.name());

        let backend_device = backend.create_device(&DeviceCreateInfo {
            app_name: settings.app_name.clone(),
            enable_validation: settings.debug_validation,
            display_handle,
        })?;
        Self::with_backend(backend_device, settings)
    }

    /// 使用已经创建好的后端设备
    pub fn with_backend(backend: Arc<dyn BackendDevice>, settings: DeviceSettings) -> Result<Self, DeviceError> {
        let _span = tracy_client::span!("Device::with_backend");
        let settings = settings.sanitized();

        let frames = (0..settings.max_frames_in_flight)
            .map(|index| Frame::new(backend.as_ref(), index, settings.max_transient_descriptor_sets))
            .collect::<Result<Vec<_>, _>>()?;
        log::info!("frame ring created: {} frames in flight", frames.len());

        let bindless = DescriptorIndexManager::new(backend.as_ref(), settings.max_descriptors_per_binding)?;
        let dummy = if settings.debug_validation {
            let dummy = DummyResources::new(backend.as_ref())?;
            bindless.set_dummy_descriptors(dummy.descriptors);
            Some(dummy)
        } else {
            None
        };

        Ok(Self {
            backend,
            frame_counter: Mutex::new(FrameCounter::new(settings.max_frames_in_flight)),
            settings,

            buffers: ResourcePool::new("buffer"),
            textures: ResourcePool::new("texture"),
            texture_views: ResourcePool::new("texture view"),
            samplers: ResourcePool::new("sampler"),
            shaders: ResourcePool::new("shader"),
            pipeline_layouts: ResourcePool::new("pipeline layout"),
            swapchains: ResourcePool::new("swapchain"),
            fences: ResourcePool::new("fence"),
            semaphores: ResourcePool::new("semaphore"),

            sampler_cache: Mutex::new(HashMap::new()),
            retired: Mutex::new(RetirementQueue::new()),

            frames,
            pipeline_cache: PipelineCache::default(),
            bindless,
            dummy,
        })
    }
}

// getters
impl Device {
    #[inline]
    pub fn backend(&self) -> &Arc<dyn BackendDevice> {
        &self.backend
    }

    #[inline]
    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    #[inline]
    pub fn max_frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// 当前帧号，同时也是延迟销毁的 epoch
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_counter.lock().frame_id()
    }

    #[inline]
    pub fn frame_index(&self) -> usize {
        self.frame_counter.lock().frame_index()
    }

    #[inline]
    pub fn frame_name(&self) -> String {
        self.frame_counter.lock().frame_name()
    }

    #[inline]
    pub fn bindless(&self) -> &DescriptorIndexManager {
        &self.bindless
    }

    /// 等待真正释放的资源数量
    #[inline]
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    #[inline]
    pub fn pipeline_cache_len(&self) -> usize {
        self.pipeline_cache.pipeline_count()
    }

    #[inline]
    pub fn render_pass_cache_len(&self) -> usize {
        self.pipeline_cache.render_pass_count()
    }

    #[inline]
    pub(crate) fn current_frame(&self) -> &Frame {
        &self.frames[self.frame_index()]
    }
}

// tools
impl Device {
    /// 以当前帧号为 epoch 放入回收队列
    pub(crate) fn retire(&self, item: RetiredResource) {
        let epoch = self.frame_id();
        self.retired.lock().retire(item, epoch);
    }

    /// 释放所有 epoch 不大于 `completed_epoch` 的资源
    pub(crate) fn collect_retired(&self, completed_epoch: u64) -> usize {
        let _span = tracy_client::span!("Device::collect_retired");
        let items = self.retired.lock().collect(completed_epoch);
        let count = items.len();
        for item in items {
            self.free_retired(item);
        }
        if count > 0 {
            log::debug!("{} released {} retired resources", self.frame_name(), count);
        }
        count
    }

    fn free_descriptor_indices(&self, indices: [Option<DescriptorIndexHandle>; 2]) {
        for handle in indices.into_iter().flatten() {
            self.bindless.free_index(handle);
        }
    }

    /// 真正销毁资源：移出资源池，归还 bindless 索引，调用后端销毁
    fn free_retired(&self, item: RetiredResource) {
        let backend = self.backend.as_ref();
        match item {
            RetiredResource::Buffer(handle) => {
                if let Some(entry) = self.buffers.remove(handle) {
                    self.free_descriptor_indices([entry.srv, entry.uav]);
                    if entry.mapped {
                        backend.unmap_buffer(entry.raw);
                    }
                    backend.destroy_buffer(entry.raw);
                }
            }
            RetiredResource::Texture(handle) => {
                // 交换链的图像随交换链一起销毁
                match self.textures.remove(handle) {
                    Some(entry) if !entry.swapchain_owned => backend.destroy_texture(entry.raw),
                    _ => {}
                }
            }
            RetiredResource::TextureView(handle) => {
                if let Some(entry) = self.texture_views.remove(handle) {
                    self.free_descriptor_indices([entry.srv, entry.uav]);
                    backend.destroy_texture_view(entry.raw);
                }
            }
            RetiredResource::Sampler(handle) => {
                if let Some(entry) = self.samplers.remove(handle) {
                    self.free_descriptor_indices([entry.srv, None]);
                    backend.destroy_sampler(entry.raw);
                }
            }
            RetiredResource::Shader(handle) => {
                if let Some(entry) = self.shaders.remove(handle) {
                    backend.destroy_shader(entry.raw);
                }
            }
            RetiredResource::PipelineLayout(handle) => {
                if let Some(entry) = self.pipeline_layouts.remove(handle) {
                    backend.destroy_pipeline_layout(entry.raw);
                }
            }
            RetiredResource::Swapchain(handle) => {
                if let Some(entry) = self.swapchains.remove(handle) {
                    backend.destroy_swapchain(entry.raw);
                }
            }
            RetiredResource::Fence(handle) => {
                if let Some(entry) = self.fences.remove(handle) {
                    backend.destroy_fence(entry.raw);
                }
            }
            RetiredResource::Semaphore(handle) => {
                if let Some(entry) = self.semaphores.remove(handle) {
                    backend.destroy_semaphore(entry.raw);
                }
            }
            RetiredResource::StagingBuffer(raw) => backend.destroy_buffer(raw),
            RetiredResource::Pipeline(raw) => backend.destroy_pipeline(raw),
            RetiredResource::DescriptorIndex(handle) => self.bindless.free_index(handle),
        }
    }
}

// destroy
impl Drop for Device {
    fn drop(&mut self) {
        log::info!("Dropping Device");
        let _span = tracy_client::span!("Device::drop");

        if let Err(e) = self.backend.wait_idle() {
            log::error!("wait idle failed while dropping device: {}", e);
        }

        let retired = self.retired.lock().drain_all();
        for item in retired {
            self.free_retired(item);
        }

        // 用户没有销毁的资源，按依赖顺序释放
        let leaked = self.buffers.len() + self.textures.len() + self.texture_views.len() + self.shaders.len();
        if leaked > 0 {
            log::warn!("{} resources were still alive when the device was dropped", leaked);
        }
        let remaining = self
            .texture_views
            .keys()
            .into_iter()
            .map(RetiredResource::TextureView)
            .chain(self.textures.keys().into_iter().map(RetiredResource::Texture))
            .chain(self.swapchains.keys().into_iter().map(RetiredResource::Swapchain))
            .chain(self.buffers.keys().into_iter().map(RetiredResource::Buffer))
            .chain(self.samplers.keys().into_iter().map(RetiredResource::Sampler))
            .chain(self.shaders.keys().into_iter().map(RetiredResource::Shader))
            .chain(self.pipeline_layouts.keys().into_iter().map(RetiredResource::PipelineLayout))
            .chain(self.fences.keys().into_iter().map(RetiredResource::Fence))
            .chain(self.semaphores.keys().into_iter().map(RetiredResource::Semaphore))
            .collect_vec();
        for item in remaining {
            self.free_retired(item);
        }
        self.sampler_cache.lock().clear();

        let backend = self.backend.as_ref();
        let (render_passes, pipelines) = self.pipeline_cache.drain();
        for pipeline in pipelines {
            backend.destroy_pipeline(pipeline);
        }
        for render_pass in render_passes {
            backend.destroy_render_pass(render_pass);
        }

        for frame in &self.frames {
            frame.destroy(backend);
        }
        if let Some(dummy) = &self.dummy {
            dummy.destroy(backend);
        }
        self.bindless.destroy(backend);
    }
}
