use std::ptr::NonNull;

use slotmap::Key;
use ze_gfx::{
    BackendDevice, DeviceResourceType, Format, GfxError, GfxResult, SwapchainDesc,
    commands::{BufferTextureCopyRegion, TextureBarrier},
    create_info::{
        BufferCreateInfo as GfxBufferCreateInfo, ComputePipelineCreateInfo, GfxPipelineCreateInfo,
        PipelineLayoutCreateInfo, RenderPassCreateInfo, SamplerCreateInfo, ShaderCreateInfo,
        SwapchainCreateInfo as GfxSwapchainCreateInfo, TextureCreateInfo as GfxTextureCreateInfo,
        TextureSubresourceRange, TextureViewCreateInfo as GfxViewCreateInfo,
    },
    descriptor::DescriptorResource,
    handle::*,
    types::*,
};

use super::{Device, RetiredResource};
use crate::{
    bindless::{BindlessDescriptorType, DescriptorIndexHandle},
    error::DeviceError,
    handles::*,
    resource_pool::ResourcePool,
    resources::*,
};

/// 标记为退休；重复销毁或无效句柄返回 false
fn mark_retired<K: Key, V: PoolEntry>(pool: &ResourcePool<K, V>, handle: K) -> bool {
    match pool.with_mut(handle, |entry| {
        let was_retired = entry.is_retired();
        entry.set_retired();
        was_retired
    }) {
        Some(false) => true,
        Some(true) => {
            log::warn!("{} {:?} destroyed twice", pool.name(), handle);
            false
        }
        None => {
            log::warn!("destroy of invalid {} handle {:?}", pool.name(), handle);
            false
        }
    }
}

/// 取出未退休的条目
fn live_entry<K: Key, V: PoolEntry + Clone>(
    pool: &ResourcePool<K, V>,
    handle: K,
    kind: DeviceResourceType,
) -> Result<V, DeviceError> {
    pool.get_cloned(handle)
        .filter(|entry| !entry.is_retired())
        .ok_or_else(|| DeviceError::invalid_handle(kind))
}

// Buffer API
impl Device {
    /// 创建 buffer
    ///
    /// 带 `STORAGE` 的 buffer 会注册 bindless SRV，带 `UNORDERED_ACCESS` 的注册 UAV。
    /// `initial_data` 非空时：CPU 可见的内存直接写入；否则通过 staging buffer 录制拷贝并立即提交，
    /// 同一队列上之后提交的命令都能看到这些数据。
    pub fn create_buffer(&self, info: &BufferCreateInfo) -> Result<BufferHandle, DeviceError> {
        let _span = tracy_client::span!("Device::create_buffer");
        if info.size == 0 {
            return Err(DeviceError::ZeroSized { what: "buffer" });
        }
        if info.initial_data.len() as u64 > info.size {
            return Err(GfxError::invalid_parameter(format!(
                "initial data ({} bytes) is larger than buffer {} ({} bytes)",
                info.initial_data.len(),
                info.debug_name,
                info.size
            ))
            .into());
        }

        let needs_staging = !info.initial_data.is_empty() && !info.memory_usage.is_cpu_visible();
        let mut usage = info.usage;
        if needs_staging {
            usage |= BufferUsage::TRANSFER_DST;
        }

        let raw = self.backend.create_buffer(&GfxBufferCreateInfo {
            size: info.size,
            usage,
            memory_usage: info.memory_usage,
            debug_name: info.debug_name.to_string(),
        })?;
        let handle = self.buffers.insert(BufferEntry {
            raw,
            size: info.size,
            usage,
            memory_usage: info.memory_usage,
            srv: None,
            uav: None,
            mapped: false,
            retired: false,
        });

        if let Err(e) = self.init_buffer(handle, raw, info, usage, needs_staging) {
            log::error!("failed to initialize buffer {}: {}", info.debug_name, e);
            self.destroy_buffer(handle);
            return Err(e);
        }
        Ok(handle)
    }

    fn init_buffer(
        &self,
        handle: BufferHandle,
        raw: RawBufferHandle,
        info: &BufferCreateInfo,
        usage: BufferUsage,
        needs_staging: bool,
    ) -> Result<(), DeviceError> {
        let resource = DescriptorResource::Buffer {
            buffer: raw,
            offset: 0,
            range: info.size,
        };
        if usage.contains(BufferUsage::STORAGE) {
            let srv = self.bindless.allocate_index(BindlessDescriptorType::StorageBuffer, false)?;
            self.buffers.with_mut(handle, |entry| entry.srv = Some(srv));
            self.bindless.update_descriptor(srv, resource);
        }
        if usage.contains(BufferUsage::UNORDERED_ACCESS) {
            let uav = self.bindless.allocate_index(BindlessDescriptorType::StorageBuffer, true)?;
            self.buffers.with_mut(handle, |entry| entry.uav = Some(uav));
            self.bindless.update_descriptor(uav, resource);
        }

        if info.initial_data.is_empty() {
            return Ok(());
        }
        if needs_staging {
            let size = info.initial_data.len() as u64;
            self.upload_via_staging(info.initial_data, |backend, list, staging| {
                backend.cmd_copy_buffer(
                    list,
                    staging,
                    raw,
                    &[ze_gfx::commands::BufferCopyRegion {
                        src_offset: 0,
                        dst_offset: 0,
                        size,
                    }],
                );
            })
        } else {
            let ptr = self.backend.map_buffer(raw)?;
            // SAFETY: 映射的内存至少有 size 字节，initial_data 的长度已经检查过
            unsafe {
                std::ptr::copy_nonoverlapping(info.initial_data.as_ptr(), ptr.as_ptr(), info.initial_data.len());
            }
            self.backend.unmap_buffer(raw);
            Ok(())
        }
    }

    /// 把数据写入 staging buffer，录制拷贝命令并立即提交到图形队列
    ///
    /// 帧还没有 `end_frame` 时，staging buffer 在当前帧退休，帧的 fence 覆盖这次提交；
    /// 帧已经结束时，帧的 fence 已经发出，这次提交使用单独的 fence 并等待完成，staging buffer 立即销毁
    fn upload_via_staging(
        &self,
        data: &[u8],
        record: impl FnOnce(&dyn BackendDevice, RawCommandListHandle, RawBufferHandle),
    ) -> Result<(), DeviceError> {
        let _span = tracy_client::span!("Device::upload_via_staging");
        let backend = self.backend.as_ref();
        let frame_open = !self.current_frame().state.lock().ended;
        let staging = backend.create_buffer(&GfxBufferCreateInfo {
            size: data.len() as u64,
            usage: BufferUsage::TRANSFER_SRC,
            memory_usage: MemoryUsage::CpuToGpu,
            debug_name: "staging".to_string(),
        })?;
        let fence = if frame_open {
            None
        } else {
            match backend.create_fence(false) {
                Ok(fence) => Some(fence),
                Err(e) => {
                    backend.destroy_buffer(staging);
                    return Err(e.into());
                }
            }
        };

        let result = (|| -> Result<(), DeviceError> {
            let ptr = backend.map_buffer(staging)?;
            // SAFETY: staging buffer 的大小就是 data 的长度
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len());
            }
            backend.unmap_buffer(staging);

            let list = self.current_frame().command_pool(QueueType::Gfx).allocate(backend)?;
            backend.begin_command_list(list)?;
            record(backend, list, staging);
            backend.end_command_list(list)?;
            backend.queue_submit(QueueType::Gfx, &[list], &[], &[], &[], fence)?;

            if let Some(fence) = fence {
                let wait = backend.wait_for_fences(&[fence], true, self.settings.fence_timeout_ns);
                if wait != GfxResult::Success {
                    return Err(DeviceError::FenceWait(wait));
                }
            }
            Ok(())
        })();

        match fence {
            Some(fence) if result.is_ok() => {
                backend.destroy_fence(fence);
                backend.destroy_buffer(staging);
            }
            Some(fence) => {
                // 提交可能仍在执行，等到设备空闲再释放
                log::warn!("staging upload outside of a frame failed, waiting for the device");
                if let Err(e) = backend.wait_idle() {
                    log::error!("wait idle failed: {}", e);
                }
                backend.destroy_fence(fence);
                backend.destroy_buffer(staging);
            }
            None => self.retire(RetiredResource::StagingBuffer(staging)),
        }
        result
    }

    pub fn destroy_buffer(&self, handle: BufferHandle) {
        if mark_retired(&self.buffers, handle) {
            self.retire(RetiredResource::Buffer(handle));
        }
    }

    /// 只有 CPU 可见的内存可以 map；映射会一直保持到 `unmap_buffer` 或者 buffer 被释放
    pub fn map_buffer(&self, handle: BufferHandle) -> Result<NonNull<u8>, DeviceError> {
        let entry = live_entry(&self.buffers, handle, DeviceResourceType::Buffer)?;
        if !entry.memory_usage.is_cpu_visible() {
            return Err(GfxError::invalid_parameter("mapping gpu-only buffer").into());
        }
        let ptr = self.backend.map_buffer(entry.raw)?;
        self.buffers.with_mut(handle, |entry| entry.mapped = true);
        Ok(ptr)
    }

    pub fn unmap_buffer(&self, handle: BufferHandle) {
        let raw = self.buffers.with_mut(handle, |entry| {
            let was_mapped = entry.mapped;
            entry.mapped = false;
            was_mapped.then_some(entry.raw)
        });
        match raw {
            Some(Some(raw)) => self.backend.unmap_buffer(raw),
            Some(None) => log::warn!("unmap of buffer {:?} that is not mapped", handle),
            None => log::warn!("unmap of invalid buffer handle {:?}", handle),
        }
    }

    /// 向 CPU 可见的 buffer 写入数据
    pub fn write_buffer(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let size = self.buffer_size(handle).ok_or(DeviceError::invalid_handle(DeviceResourceType::Buffer))?;
        let end = offset.checked_add(data.len() as u64).filter(|end| *end <= size);
        if end.is_none() {
            return Err(GfxError::invalid_parameter(format!(
                "write of {} bytes at {} overflows buffer of {} bytes",
                data.len(),
                offset,
                size
            ))
            .into());
        }
        let ptr = self.map_buffer(handle)?;
        // SAFETY: 范围已经检查
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr().add(offset as usize), data.len());
        }
        self.unmap_buffer(handle);
        Ok(())
    }

    #[inline]
    pub fn is_valid_buffer(&self, handle: BufferHandle) -> bool {
        self.buffers.contains(handle)
    }

    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    #[inline]
    pub fn buffer_size(&self, handle: BufferHandle) -> Option<u64> {
        self.buffers.with(handle, |entry| entry.size)
    }

    #[inline]
    pub fn buffer_raw(&self, handle: BufferHandle) -> Option<RawBufferHandle> {
        self.buffers.with(handle, |entry| entry.raw)
    }

    /// buffer 在 bindless 表中的索引
    pub fn buffer_descriptor_index(&self, handle: BufferHandle, is_uav: bool) -> Option<DescriptorIndexHandle> {
        self.buffers
            .with(handle, |entry| if is_uav { entry.uav } else { entry.srv })
            .flatten()
    }
}

// Texture API
impl Device {
    /// 创建 texture；`initial_data` 是紧密排列的第 0 级 mip，通过 staging buffer 上传，
    /// 上传完成后 texture 处于 `ShaderReadOnly` 布局
    pub fn create_texture(&self, info: &TextureCreateInfo) -> Result<TextureHandle, DeviceError> {
        let _span = tracy_client::span!("Device::create_texture");
        let desc = &info.info;
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 || desc.mip_levels == 0 || desc.array_layers == 0 {
            return Err(DeviceError::ZeroSized { what: "texture" });
        }

        let mut desc = desc.clone();
        if !info.initial_data.is_empty() {
            desc.usage |= TextureUsage::TRANSFER_DST;
        }
        let raw = self.backend.create_texture(&desc)?;
        let handle = self.textures.insert(TextureEntry {
            raw,
            info: desc.clone(),
            swapchain_owned: false,
            retired: false,
        });

        if !info.initial_data.is_empty() {
            if let Err(e) = self.upload_texture(raw, &desc, info.initial_data) {
                log::error!("failed to upload texture {}: {}", desc.debug_name, e);
                self.destroy_texture(handle);
                return Err(e);
            }
        }
        Ok(handle)
    }

    fn upload_texture(&self, raw: RawTextureHandle, desc: &GfxTextureCreateInfo, data: &[u8]) -> Result<(), DeviceError> {
        let range = TextureSubresourceRange {
            layer_count: desc.array_layers,
            ..Default::default()
        };
        let (width, height, depth, layer_count) = (desc.width, desc.height, desc.depth, desc.array_layers);

        self.upload_via_staging(data, |backend, list, staging| {
            backend.cmd_pipeline_barrier(
                list,
                &[TextureBarrier {
                    texture: raw,
                    src_stage: PipelineStage::TOP_OF_PIPE,
                    src_access: Access::empty(),
                    dst_stage: PipelineStage::TRANSFER,
                    dst_access: Access::TRANSFER_WRITE,
                    old_layout: TextureLayout::Undefined,
                    new_layout: TextureLayout::TransferDst,
                    range,
                }],
                &[],
            );
            backend.cmd_copy_buffer_to_texture(
                list,
                staging,
                raw,
                &[BufferTextureCopyRegion {
                    buffer_offset: 0,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count,
                    width,
                    height,
                    depth,
                }],
            );
            backend.cmd_pipeline_barrier(
                list,
                &[TextureBarrier {
                    texture: raw,
                    src_stage: PipelineStage::TRANSFER,
                    src_access: Access::TRANSFER_WRITE,
                    dst_stage: PipelineStage::FRAGMENT_SHADER | PipelineStage::COMPUTE_SHADER,
                    dst_access: Access::SHADER_READ,
                    old_layout: TextureLayout::TransferDst,
                    new_layout: TextureLayout::ShaderReadOnly,
                    range,
                }],
                &[],
            );
        })
    }

    pub fn destroy_texture(&self, handle: TextureHandle) {
        if self.textures.with(handle, |entry| entry.swapchain_owned) == Some(true) {
            log::warn!("texture {:?} belongs to a swapchain, destroy the swapchain instead", handle);
            return;
        }
        if mark_retired(&self.textures, handle) {
            self.retire(RetiredResource::Texture(handle));
        }
    }

    #[inline]
    pub fn is_valid_texture(&self, handle: TextureHandle) -> bool {
        self.textures.contains(handle)
    }

    #[inline]
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    #[inline]
    pub fn texture_info(&self, handle: TextureHandle) -> Option<GfxTextureCreateInfo> {
        self.textures.with(handle, |entry| entry.info.clone())
    }
}

// Texture view API
impl Device {
    /// 创建 texture view
    ///
    /// 可采样的 2D/Cube view 注册 bindless SRV，带 `STORAGE` 的 2D view 注册 UAV
    pub fn create_texture_view(&self, info: &TextureViewCreateInfo) -> Result<TextureViewHandle, DeviceError> {
        let texture = live_entry(&self.textures, info.texture, DeviceResourceType::Texture)?;
        let format = info.format.unwrap_or(texture.info.format);
        let raw = self.backend.create_texture_view(&GfxViewCreateInfo {
            texture: texture.raw,
            view_type: info.view_type,
            format,
            range: info.range,
            debug_name: format!("{}-view", texture.info.debug_name),
        })?;
        let handle = self.texture_views.insert(TextureViewEntry {
            raw,
            texture: info.texture,
            format,
            view_type: info.view_type,
            srv: None,
            uav: None,
            retired: false,
        });

        if let Err(e) = self.register_texture_view(handle, raw, info.view_type, texture.info.usage) {
            self.destroy_texture_view(handle);
            return Err(e);
        }
        Ok(handle)
    }

    fn register_texture_view(
        &self,
        handle: TextureViewHandle,
        raw: RawTextureViewHandle,
        view_type: TextureViewType,
        usage: TextureUsage,
    ) -> Result<(), DeviceError> {
        let srv_type = match view_type {
            TextureViewType::View2D => Some(BindlessDescriptorType::Texture2D),
            TextureViewType::ViewCube => Some(BindlessDescriptorType::TextureCube),
            _ => None,
        };
        if let Some(ty) = srv_type.filter(|_| usage.contains(TextureUsage::SAMPLED)) {
            let srv = self.bindless.allocate_index(ty, false)?;
            self.texture_views.with_mut(handle, |entry| entry.srv = Some(srv));
            self.bindless.update_descriptor(
                srv,
                DescriptorResource::TextureView {
                    view: raw,
                    layout: TextureLayout::ShaderReadOnly,
                },
            );
        }
        if view_type == TextureViewType::View2D && usage.contains(TextureUsage::STORAGE) {
            let uav = self.bindless.allocate_index(BindlessDescriptorType::Texture2D, true)?;
            self.texture_views.with_mut(handle, |entry| entry.uav = Some(uav));
            self.bindless.update_descriptor(
                uav,
                DescriptorResource::TextureView {
                    view: raw,
                    layout: TextureLayout::General,
                },
            );
        }
        Ok(())
    }

    pub fn destroy_texture_view(&self, handle: TextureViewHandle) {
        if mark_retired(&self.texture_views, handle) {
            self.retire(RetiredResource::TextureView(handle));
        }
    }

    #[inline]
    pub fn is_valid_texture_view(&self, handle: TextureViewHandle) -> bool {
        self.texture_views.contains(handle)
    }

    #[inline]
    pub fn texture_view_count(&self) -> usize {
        self.texture_views.len()
    }

    #[inline]
    pub fn texture_view_format(&self, handle: TextureViewHandle) -> Option<Format> {
        self.texture_views.with(handle, |entry| entry.format)
    }

    /// view 所属的 texture
    #[inline]
    pub fn texture_view_texture(&self, handle: TextureViewHandle) -> Option<TextureHandle> {
        self.texture_views.with(handle, |entry| entry.texture)
    }

    pub fn texture_view_descriptor_index(
        &self,
        handle: TextureViewHandle,
        is_uav: bool,
    ) -> Option<DescriptorIndexHandle> {
        self.texture_views
            .with(handle, |entry| if is_uav { entry.uav } else { entry.srv })
            .flatten()
    }
}

// Sampler API
impl Device {
    /// 相同的描述只创建一个 sampler
    pub fn get_or_create_sampler(&self, info: &SamplerCreateInfo) -> Result<SamplerHandle, DeviceError> {
        let mut cache = self.sampler_cache.lock();
        if let Some(handle) = cache.get(info) {
            return Ok(*handle);
        }

        let raw = self.backend.create_sampler(info)?;
        let srv = match self.bindless.allocate_index(BindlessDescriptorType::Sampler, false) {
            Ok(srv) => srv,
            Err(e) => {
                self.backend.destroy_sampler(raw);
                return Err(e);
            }
        };
        self.bindless.update_descriptor(srv, DescriptorResource::Sampler(raw));

        let handle = self.samplers.insert(SamplerEntry {
            raw,
            srv: Some(srv),
            retired: false,
        });
        cache.insert(info.clone(), handle);
        Ok(handle)
    }

    pub fn destroy_sampler(&self, handle: SamplerHandle) {
        if mark_retired(&self.samplers, handle) {
            self.sampler_cache.lock().retain(|_, cached| *cached != handle);
            self.retire(RetiredResource::Sampler(handle));
        }
    }

    #[inline]
    pub fn is_valid_sampler(&self, handle: SamplerHandle) -> bool {
        self.samplers.contains(handle)
    }

    #[inline]
    pub fn sampler_count(&self) -> usize {
        self.samplers.len()
    }

    pub fn sampler_descriptor_index(&self, handle: SamplerHandle) -> Option<DescriptorIndexHandle> {
        self.samplers.with(handle, |entry| entry.srv).flatten()
    }
}

// Shader & pipeline API
impl Device {
    pub fn create_shader(&self, info: &ShaderCreateInfo) -> Result<ShaderHandle, DeviceError> {
        if info.bytecode.is_empty() {
            return Err(DeviceError::ZeroSized { what: "shader bytecode" });
        }
        let raw = self.backend.create_shader(info)?;
        Ok(self.shaders.insert(ShaderEntry {
            raw,
            stage: info.stage,
            retired: false,
        }))
    }

    /// 引用这个 shader 的 pipeline 会从缓存中移除，并与 shader 一起延迟销毁
    pub fn destroy_shader(&self, handle: ShaderHandle) {
        if !self.shaders.with(handle, |entry| entry.is_retired()).unwrap_or(true) {
            self.invalidate_pipelines_using_shader(handle);
        }
        if mark_retired(&self.shaders, handle) {
            self.retire(RetiredResource::Shader(handle));
        }
    }

    #[inline]
    pub fn is_valid_shader(&self, handle: ShaderHandle) -> bool {
        self.shaders.contains(handle)
    }

    #[inline]
    pub fn shader_count(&self) -> usize {
        self.shaders.len()
    }

    #[inline]
    pub fn shader_stage(&self, handle: ShaderHandle) -> Option<ze_gfx::ShaderStage> {
        self.shaders.with(handle, |entry| entry.stage)
    }

    #[inline]
    pub fn shader_raw(&self, handle: ShaderHandle) -> Option<RawShaderHandle> {
        self.shaders.with(handle, |entry| entry.raw)
    }

    /// 创建 pipeline layout，set 0 固定为 bindless set
    pub fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> Result<PipelineLayoutHandle, DeviceError> {
        let info = PipelineLayoutCreateInfo {
            set_layouts: std::iter::once(self.bindless.set_layout().clone()).chain(desc.sets.iter().cloned()).collect(),
            push_constant_ranges: desc.push_constant_ranges.clone(),
        };
        let raw = self.backend.create_pipeline_layout(&info)?;
        Ok(self.pipeline_layouts.insert(PipelineLayoutEntry {
            raw,
            info,
            retired: false,
        }))
    }

    pub fn destroy_pipeline_layout(&self, handle: PipelineLayoutHandle) {
        if mark_retired(&self.pipeline_layouts, handle) {
            self.retire(RetiredResource::PipelineLayout(handle));
        }
    }

    #[inline]
    pub fn is_valid_pipeline_layout(&self, handle: PipelineLayoutHandle) -> bool {
        self.pipeline_layouts.contains(handle)
    }

    #[inline]
    pub fn pipeline_layout_count(&self) -> usize {
        self.pipeline_layouts.len()
    }

    #[inline]
    pub fn pipeline_layout_raw(&self, handle: PipelineLayoutHandle) -> Option<RawPipelineLayoutHandle> {
        self.pipeline_layouts.with(handle, |entry| entry.raw)
    }

    pub fn get_or_create_render_pass(&self, info: &RenderPassCreateInfo) -> Result<RawRenderPassHandle, DeviceError> {
        Ok(self.pipeline_cache.get_or_create_render_pass(self.backend.as_ref(), info)?)
    }

    pub fn get_or_create_gfx_pipeline(&self, info: &GfxPipelineCreateInfo) -> Result<RawPipelineHandle, DeviceError> {
        Ok(self.pipeline_cache.get_or_create_gfx_pipeline(self.backend.as_ref(), info)?)
    }

    pub fn get_or_create_compute_pipeline(
        &self,
        info: &ComputePipelineCreateInfo,
    ) -> Result<RawPipelineHandle, DeviceError> {
        Ok(self.pipeline_cache.get_or_create_compute_pipeline(self.backend.as_ref(), info)?)
    }

    /// shader 热重载：移除所有引用该 shader 的 pipeline，返回移除的数量
    pub fn invalidate_pipelines_using_shader(&self, shader: ShaderHandle) -> usize {
        let Some(raw) = self.shader_raw(shader) else {
            return 0;
        };
        let pipelines = self.pipeline_cache.invalidate_shader(raw);
        for pipeline in &pipelines {
            self.retire(RetiredResource::Pipeline(*pipeline));
        }
        if !pipelines.is_empty() {
            log::info!("{} pipelines invalidated by shader {:?}", pipelines.len(), shader);
        }
        pipelines.len()
    }
}

// Sync API
impl Device {
    pub fn create_fence(&self, signaled: bool) -> Result<FenceHandle, DeviceError> {
        let raw = self.backend.create_fence(signaled)?;
        Ok(self.fences.insert(SyncEntry { raw, retired: false }))
    }

    pub fn destroy_fence(&self, handle: FenceHandle) {
        if mark_retired(&self.fences, handle) {
            self.retire(RetiredResource::Fence(handle));
        }
    }

    /// `Timeout` 不是错误，原样返回
    pub fn wait_for_fences(&self, fences: &[FenceHandle], wait_all: bool, timeout_ns: u64) -> Result<GfxResult, DeviceError> {
        let raw = self.raw_fences(fences)?;
        Ok(self.backend.wait_for_fences(&raw, wait_all, timeout_ns))
    }

    pub fn reset_fences(&self, fences: &[FenceHandle]) -> Result<(), DeviceError> {
        let raw = self.raw_fences(fences)?;
        Ok(self.backend.reset_fences(&raw)?)
    }

    fn raw_fences(&self, fences: &[FenceHandle]) -> Result<Vec<RawFenceHandle>, DeviceError> {
        fences
            .iter()
            .map(|fence| {
                self.fences
                    .with(*fence, |entry| entry.raw)
                    .ok_or(DeviceError::invalid_handle(DeviceResourceType::Fence))
            })
            .collect()
    }

    pub fn create_semaphore(&self) -> Result<SemaphoreHandle, DeviceError> {
        let raw = self.backend.create_semaphore()?;
        Ok(self.semaphores.insert(SyncEntry { raw, retired: false }))
    }

    pub fn destroy_semaphore(&self, handle: SemaphoreHandle) {
        if mark_retired(&self.semaphores, handle) {
            self.retire(RetiredResource::Semaphore(handle));
        }
    }

    pub(crate) fn raw_semaphores(&self, semaphores: &[SemaphoreHandle]) -> Result<Vec<RawSemaphoreHandle>, DeviceError> {
        semaphores
            .iter()
            .map(|semaphore| {
                self.semaphores
                    .with(*semaphore, |entry| entry.raw)
                    .ok_or(DeviceError::invalid_handle(DeviceResourceType::Semaphore))
            })
            .collect()
    }

    #[inline]
    pub fn is_valid_fence(&self, handle: FenceHandle) -> bool {
        self.fences.contains(handle)
    }

    #[inline]
    pub fn is_valid_semaphore(&self, handle: SemaphoreHandle) -> bool {
        self.semaphores.contains(handle)
    }

    #[inline]
    pub fn fence_count(&self) -> usize {
        self.fences.len()
    }

    #[inline]
    pub fn semaphore_count(&self) -> usize {
        self.semaphores.len()
    }
}

// Swapchain API
impl Device {
    /// 创建交换链，并为每张图像包装 texture 与 view
    ///
    /// 传入 `old_swapchain` 时，旧交换链会在当前帧退休，调用方不需要再销毁它
    pub fn create_swapchain(&self, info: &SwapchainCreateInfo) -> Result<SwapchainHandle, DeviceError> {
        let _span = tracy_client::span!("Device::create_swapchain");
        if info.width == 0 || info.height == 0 {
            return Err(DeviceError::ZeroSized { what: "swapchain" });
        }
        let old_raw = match info.old_swapchain {
            Some(old) => Some(live_entry(&self.swapchains, old, DeviceResourceType::Swapchain)?.raw),
            None => None,
        };

        let raw = self.backend.create_swapchain(&GfxSwapchainCreateInfo {
            display_handle: info.display_handle,
            window_handle: info.window_handle,
            width: info.width,
            height: info.height,
            preferred_format: info.preferred_format,
            vsync: info.vsync,
            old_swapchain: old_raw,
        })?;
        if let Some(old) = info.old_swapchain {
            self.destroy_swapchain(old);
        }

        let desc = match self.backend.swapchain_desc(raw) {
            Ok(desc) => desc,
            Err(e) => {
                // 还没有被任何命令引用，可以直接销毁
                self.backend.destroy_swapchain(raw);
                return Err(e.into());
            }
        };
        let handle = self.swapchains.insert(SwapchainEntry {
            raw,
            desc,
            textures: Vec::new(),
            views: Vec::new(),
            retired: false,
        });
        if let Err(e) = self.init_swapchain_images(handle, raw, desc) {
            log::error!("failed to wrap swapchain images: {}", e);
            self.destroy_swapchain(handle);
            return Err(e);
        }

        log::info!(
            "swapchain created: {}x{} {:?}, {} images",
            desc.width,
            desc.height,
            desc.format,
            desc.image_count
        );
        Ok(handle)
    }

    /// 为交换链的每张图像包装 texture 与 view，每创建一个就记录到交换链上，失败时随交换链一起退休
    fn init_swapchain_images(
        &self,
        handle: SwapchainHandle,
        raw: RawSwapchainHandle,
        desc: SwapchainDesc,
    ) -> Result<(), DeviceError> {
        let raw_textures = self.backend.swapchain_textures(raw)?;
        for (i, raw_texture) in raw_textures.into_iter().enumerate() {
            let texture = self.textures.insert(TextureEntry {
                raw: raw_texture,
                info: GfxTextureCreateInfo {
                    debug_name: format!("swapchain-{}", i),
                    ..GfxTextureCreateInfo::new_2d(desc.format, desc.width, desc.height, TextureUsage::COLOR_ATTACHMENT)
                },
                swapchain_owned: true,
                retired: false,
            });
            self.swapchains.with_mut(handle, |entry| entry.textures.push(texture));
            let view = self.create_texture_view(&TextureViewCreateInfo::whole_2d(texture))?;
            self.swapchains.with_mut(handle, |entry| entry.views.push(view));
        }
        Ok(())
    }

    /// 交换链的 view 和 texture 一起退休
    pub fn destroy_swapchain(&self, handle: SwapchainHandle) {
        let Some(entry) = self.swapchains.get_cloned(handle) else {
            log::warn!("destroy of invalid swapchain handle {:?}", handle);
            return;
        };
        if !mark_retired(&self.swapchains, handle) {
            return;
        }
        for view in &entry.views {
            self.destroy_texture_view(*view);
        }
        for texture in &entry.textures {
            if mark_retired(&self.textures, *texture) {
                self.retire(RetiredResource::Texture(*texture));
            }
        }
        self.retire(RetiredResource::Swapchain(handle));
    }

    #[inline]
    pub fn is_valid_swapchain(&self, handle: SwapchainHandle) -> bool {
        self.swapchains.contains(handle)
    }

    #[inline]
    pub fn swapchain_desc(&self, handle: SwapchainHandle) -> Option<SwapchainDesc> {
        self.swapchains.with(handle, |entry| entry.desc)
    }

    /// 按图像序号排列的 view
    #[inline]
    pub fn swapchain_texture_views(&self, handle: SwapchainHandle) -> Option<Vec<TextureViewHandle>> {
        self.swapchains.with(handle, |entry| entry.views.clone())
    }

    #[inline]
    pub fn swapchain_textures(&self, handle: SwapchainHandle) -> Option<Vec<TextureHandle>> {
        self.swapchains.with(handle, |entry| entry.textures.clone())
    }
}
