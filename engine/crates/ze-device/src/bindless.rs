use std::collections::BTreeMap;

use parking_lot::Mutex;
use ze_gfx::{
    BackendDevice, GfxError,
    create_info::PipelineLayoutCreateInfo,
    descriptor::{
        DescriptorPoolCreateInfo, DescriptorResource, DescriptorSetLayoutBinding, DescriptorSetLayoutDesc,
        DescriptorType, DescriptorWrite,
    },
    handle::{
        RawBufferHandle, RawDescriptorPoolHandle, RawDescriptorSetHandle, RawPipelineLayoutHandle, RawSamplerHandle,
        RawTextureViewHandle,
    },
    types::TextureLayout,
};

use crate::error::DeviceError;

/// bindless 表中的资源种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BindlessDescriptorType {
    StorageBuffer,
    Texture2D,
    TextureCube,
    Sampler,
}

impl BindlessDescriptorType {
    /// 所有 (种类, is_uav) 组合以及它们在 bindless set 中的 binding
    pub const POOLS: [(BindlessDescriptorType, bool, u32); 6] = [
        (BindlessDescriptorType::StorageBuffer, false, 0),
        (BindlessDescriptorType::StorageBuffer, true, 1),
        (BindlessDescriptorType::Texture2D, false, 2),
        (BindlessDescriptorType::Texture2D, true, 3),
        (BindlessDescriptorType::TextureCube, false, 4),
        (BindlessDescriptorType::Sampler, false, 5),
    ];

    /// 不支持的组合返回 None
    pub fn binding(self, is_uav: bool) -> Option<u32> {
        Self::POOLS
            .iter()
            .find(|(ty, uav, _)| *ty == self && *uav == is_uav)
            .map(|(_, _, binding)| *binding)
    }

    pub fn descriptor_type(self, is_uav: bool) -> DescriptorType {
        match (self, is_uav) {
            (BindlessDescriptorType::StorageBuffer, _) => DescriptorType::StorageBuffer,
            (BindlessDescriptorType::Texture2D, true) => DescriptorType::StorageTexture,
            (BindlessDescriptorType::Texture2D, false) | (BindlessDescriptorType::TextureCube, _) => {
                DescriptorType::SampledTexture
            }
            (BindlessDescriptorType::Sampler, _) => DescriptorType::Sampler,
        }
    }
}

/// bindless 表中的一个槽位
///
/// shader 通过 push constant 中的 `index` 访问资源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorIndexHandle {
    pub ty: BindlessDescriptorType,
    pub is_uav: bool,
    pub index: u32,
}

/// 释放槽位时写回的占位资源，避免验证层报告悬空的 descriptor
#[derive(Debug, Clone, Copy)]
pub struct DummyDescriptors {
    pub buffer: RawBufferHandle,
    pub texture_2d: RawTextureViewHandle,
    pub storage_2d: RawTextureViewHandle,
    pub texture_cube: RawTextureViewHandle,
    pub sampler: RawSamplerHandle,
}

impl DummyDescriptors {
    fn resource_for(&self, ty: BindlessDescriptorType, is_uav: bool) -> DescriptorResource {
        match (ty, is_uav) {
            (BindlessDescriptorType::StorageBuffer, _) => DescriptorResource::Buffer {
                buffer: self.buffer,
                offset: 0,
                range: u64::MAX,
            },
            (BindlessDescriptorType::Texture2D, false) => DescriptorResource::TextureView {
                view: self.texture_2d,
                layout: TextureLayout::ShaderReadOnly,
            },
            (BindlessDescriptorType::Texture2D, true) => DescriptorResource::TextureView {
                view: self.storage_2d,
                layout: TextureLayout::General,
            },
            (BindlessDescriptorType::TextureCube, _) => DescriptorResource::TextureView {
                view: self.texture_cube,
                layout: TextureLayout::ShaderReadOnly,
            },
            (BindlessDescriptorType::Sampler, _) => DescriptorResource::Sampler(self.sampler),
        }
    }
}

#[derive(Default)]
struct IndexPool {
    /// 从未分配过的最小索引
    next: u32,
    /// 回收的索引，后进先出
    free: Vec<u32>,
    live: u32,
}

/// bindless descriptor 索引管理
///
/// 全局只有一个 bindless descriptor set，每种资源一个固定容量的数组。
/// 创建资源时分配索引，销毁时回收；descriptor 的写入先缓存，在下一次提交前统一 flush。
///
/// # 线程
/// 任何线程都可以分配索引和缓存写入，但 `flush_updates` 只能在录制线程、提交之前调用。
pub struct DescriptorIndexManager {
    capacity: u32,
    pools: Mutex<BTreeMap<(BindlessDescriptorType, bool), IndexPool>>,
    pending_writes: Mutex<Vec<DescriptorWrite>>,

    descriptor_pool: RawDescriptorPoolHandle,
    pipeline_layout: RawPipelineLayoutHandle,
    set: RawDescriptorSetHandle,
    set_layout: DescriptorSetLayoutDesc,

    dummy: Mutex<Option<DummyDescriptors>>,
}

// new & init
impl DescriptorIndexManager {
    pub fn new(backend: &dyn BackendDevice, capacity: u32) -> Result<Self, GfxError> {
        let set_layout = Self::bindless_set_layout(capacity);

        let descriptor_pool = backend.create_descriptor_pool(&DescriptorPoolCreateInfo {
            max_sets: 1,
            pool_sizes: set_layout.bindings.iter().map(|b| (b.ty, b.count)).collect(),
            update_after_bind: true,
        })?;
        let pipeline_layout = backend.create_pipeline_layout(&PipelineLayoutCreateInfo {
            set_layouts: vec![set_layout.clone()],
            push_constant_ranges: vec![],
        })?;
        let set = backend.allocate_descriptor_set(descriptor_pool, pipeline_layout, 0)?;

        log::info!("bindless descriptor set created, {} descriptors per binding", capacity);
        Ok(Self {
            capacity,
            pools: Mutex::new(BTreeMap::new()),
            pending_writes: Mutex::new(Vec::new()),
            descriptor_pool,
            pipeline_layout,
            set,
            set_layout,
            dummy: Mutex::new(None),
        })
    }

    /// bindless set 的 layout，所有 pipeline layout 的 set 0 都是它
    pub fn bindless_set_layout(capacity: u32) -> DescriptorSetLayoutDesc {
        DescriptorSetLayoutDesc {
            bindings: BindlessDescriptorType::POOLS
                .iter()
                .map(|(ty, is_uav, binding)| {
                    DescriptorSetLayoutBinding::bindless(*binding, ty.descriptor_type(*is_uav), capacity)
                })
                .collect(),
        }
    }

    /// 开启后，释放的槽位会被写回占位资源
    pub fn set_dummy_descriptors(&self, dummy: DummyDescriptors) {
        *self.dummy.lock() = Some(dummy);
    }

    pub fn destroy(&self, backend: &dyn BackendDevice) {
        backend.destroy_pipeline_layout(self.pipeline_layout);
        backend.destroy_descriptor_pool(self.descriptor_pool);
    }
}

// getters
impl DescriptorIndexManager {
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn descriptor_set(&self) -> RawDescriptorSetHandle {
        self.set
    }

    #[inline]
    pub fn set_layout(&self) -> &DescriptorSetLayoutDesc {
        &self.set_layout
    }

    pub fn live_count(&self, ty: BindlessDescriptorType, is_uav: bool) -> u32 {
        self.pools.lock().get(&(ty, is_uav)).map_or(0, |pool| pool.live)
    }

    #[inline]
    pub fn pending_write_count(&self) -> usize {
        self.pending_writes.lock().len()
    }
}

// tools
impl DescriptorIndexManager {
    /// 从对应的池中取一个索引；池满时返回错误
    pub fn allocate_index(&self, ty: BindlessDescriptorType, is_uav: bool) -> Result<DescriptorIndexHandle, DeviceError> {
        if ty.binding(is_uav).is_none() {
            return Err(DeviceError::UnsupportedDescriptor { ty, is_uav });
        }

        let mut pools = self.pools.lock();
        let pool = pools.entry((ty, is_uav)).or_default();
        let index = match pool.free.pop() {
            Some(index) => index,
            None if pool.next < self.capacity => {
                pool.next += 1;
                pool.next - 1
            }
            None => {
                log::error!("bindless pool {:?} (uav: {}) exhausted at {} descriptors", ty, is_uav, self.capacity);
                return Err(DeviceError::DescriptorPoolExhausted { ty, is_uav });
            }
        };
        pool.live += 1;

        Ok(DescriptorIndexHandle { ty, is_uav, index })
    }

    /// 回收索引
    ///
    /// 槽位中的 descriptor 不会立即改写，直到下一次分配覆盖它；开启 debug 验证时会写回占位资源。
    /// 调用方需要保证已经没有在途的 GPU 工作引用该槽位。
    pub fn free_index(&self, handle: DescriptorIndexHandle) {
        {
            let mut pools = self.pools.lock();
            let Some(pool) = pools.get_mut(&(handle.ty, handle.is_uav)) else {
                log::error!("free of unknown bindless index {:?}", handle);
                return;
            };
            if handle.index >= pool.next || pool.free.contains(&handle.index) {
                log::error!("double free or foreign bindless index {:?}, ignored", handle);
                return;
            }
            pool.free.push(handle.index);
            pool.live -= 1;
        }

        let dummy = *self.dummy.lock();
        if let Some(dummy) = dummy {
            self.update_descriptor(handle, dummy.resource_for(handle.ty, handle.is_uav));
        }
    }

    /// 缓存一次写入，`flush_updates` 时才真正提交给后端
    pub fn update_descriptor(&self, handle: DescriptorIndexHandle, resource: DescriptorResource) {
        let Some(binding) = handle.ty.binding(handle.is_uav) else {
            log::error!("update of unsupported bindless slot {:?}", handle);
            return;
        };
        self.pending_writes.lock().push(DescriptorWrite {
            set: self.set,
            binding,
            array_element: handle.index,
            ty: handle.ty.descriptor_type(handle.is_uav),
            resource,
        });
    }

    /// 把缓存的写入一次性提交，返回写入的数量
    pub fn flush_updates(&self, backend: &dyn BackendDevice) -> usize {
        let writes = std::mem::take(&mut *self.pending_writes.lock());
        if writes.is_empty() {
            return 0;
        }
        backend.update_descriptor_sets(&writes);
        writes.len()
    }
}

impl Drop for DescriptorIndexManager {
    fn drop(&mut self) {
        log::info!("Dropping DescriptorIndexManager");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use ze_gfx::headless::{BackendCall, HeadlessBackendDevice};

    use super::*;

    fn manager(backend: &HeadlessBackendDevice, capacity: u32) -> DescriptorIndexManager {
        DescriptorIndexManager::new(backend, capacity).unwrap()
    }

    #[test]
    fn test_live_indices_are_unique() {
        let backend = HeadlessBackendDevice::new();
        let manager = manager(&backend, 64);

        let indices = (0..64)
            .map(|_| manager.allocate_index(BindlessDescriptorType::Texture2D, false).unwrap().index)
            .collect::<HashSet<_>>();
        assert_eq!(indices.len(), 64);
        assert_eq!(manager.live_count(BindlessDescriptorType::Texture2D, false), 64);
    }

    #[test]
    fn test_freed_index_is_recycled() {
        let backend = HeadlessBackendDevice::new();
        let manager = manager(&backend, 16);

        let a = manager.allocate_index(BindlessDescriptorType::StorageBuffer, true).unwrap();
        let b = manager.allocate_index(BindlessDescriptorType::StorageBuffer, true).unwrap();
        assert_ne!(a.index, b.index);

        manager.free_index(a);
        let c = manager.allocate_index(BindlessDescriptorType::StorageBuffer, true).unwrap();
        assert_eq!(c.index, a.index);
        assert_ne!(c.index, b.index);
    }

    #[test]
    fn test_double_free_ignored() {
        let backend = HeadlessBackendDevice::new();
        let manager = manager(&backend, 4);

        let a = manager.allocate_index(BindlessDescriptorType::Sampler, false).unwrap();
        let b = manager.allocate_index(BindlessDescriptorType::Sampler, false).unwrap();
        manager.free_index(a);
        manager.free_index(a);
        assert_eq!(manager.live_count(BindlessDescriptorType::Sampler, false), 1);

        // 从未分配过的索引
        manager.free_index(DescriptorIndexHandle { index: 3, ..b });
        assert_eq!(manager.live_count(BindlessDescriptorType::Sampler, false), 1);

        // 回收的索引只能被取出一次
        let c = manager.allocate_index(BindlessDescriptorType::Sampler, false).unwrap();
        let d = manager.allocate_index(BindlessDescriptorType::Sampler, false).unwrap();
        assert_eq!(c.index, a.index);
        assert_ne!(d.index, a.index);
        assert_ne!(d.index, b.index);
    }

    #[test]
    fn test_pools_are_independent() {
        let backend = HeadlessBackendDevice::new();
        let manager = manager(&backend, 16);

        let srv = manager.allocate_index(BindlessDescriptorType::StorageBuffer, false).unwrap();
        let uav = manager.allocate_index(BindlessDescriptorType::StorageBuffer, true).unwrap();
        assert_eq!(srv.index, 0);
        assert_eq!(uav.index, 0);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let backend = HeadlessBackendDevice::new();
        let manager = manager(&backend, 2);

        manager.allocate_index(BindlessDescriptorType::Sampler, false).unwrap();
        manager.allocate_index(BindlessDescriptorType::Sampler, false).unwrap();
        assert!(matches!(
            manager.allocate_index(BindlessDescriptorType::Sampler, false),
            Err(DeviceError::DescriptorPoolExhausted { .. })
        ));
    }

    #[test]
    fn test_unsupported_combination() {
        let backend = HeadlessBackendDevice::new();
        let manager = manager(&backend, 2);
        assert!(matches!(
            manager.allocate_index(BindlessDescriptorType::TextureCube, true),
            Err(DeviceError::UnsupportedDescriptor { .. })
        ));
    }

    #[test]
    fn test_writes_are_batched() {
        let backend = HeadlessBackendDevice::new();
        let manager = manager(&backend, 8);

        for i in 0..3 {
            let handle = manager.allocate_index(BindlessDescriptorType::Sampler, false).unwrap();
            manager.update_descriptor(handle, DescriptorResource::Sampler(RawSamplerHandle::new(100 + i)));
        }
        assert_eq!(manager.pending_write_count(), 3);
        backend.clear_calls();

        assert_eq!(manager.flush_updates(&backend), 3);
        assert_eq!(manager.flush_updates(&backend), 0);

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        let BackendCall::UpdateDescriptorSets(writes) = &calls[0] else {
            panic!("expected a single batched update, got {:?}", calls);
        };
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|w| w.binding == 5 && w.set == manager.descriptor_set()));
    }

    #[test]
    fn test_free_writes_dummy_when_validating() {
        let backend = HeadlessBackendDevice::new();
        let manager = manager(&backend, 8);
        let dummy = DummyDescriptors {
            buffer: RawBufferHandle::new(1),
            texture_2d: RawTextureViewHandle::new(2),
            storage_2d: RawTextureViewHandle::new(3),
            texture_cube: RawTextureViewHandle::new(4),
            sampler: RawSamplerHandle::new(5),
        };

        let handle = manager.allocate_index(BindlessDescriptorType::Texture2D, false).unwrap();
        manager.free_index(handle);
        assert_eq!(manager.pending_write_count(), 0);

        manager.set_dummy_descriptors(dummy);
        let handle = manager.allocate_index(BindlessDescriptorType::Texture2D, false).unwrap();
        manager.free_index(handle);
        assert_eq!(manager.pending_write_count(), 1);
    }
}
