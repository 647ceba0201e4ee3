use parking_lot::Mutex;
use slotmap::{DefaultKey, Key, KeyData, SlotMap};
use ze_gfx::{
    GfxError,
    handle::{DeviceResourceHandle, ResourceKind},
};

/// 某一类 Vulkan 对象的存放表
///
/// 后端句柄的 index 是 slotmap key 的 ffi 表示，带有 generation，过期的句柄查不到对象。
pub(crate) struct ObjectTable<K: ResourceKind, T> {
    objects: Mutex<SlotMap<DefaultKey, T>>,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K: ResourceKind, T> Default for ObjectTable<K, T> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(SlotMap::new()),
            _kind: std::marker::PhantomData,
        }
    }
}

impl<K: ResourceKind, T> ObjectTable<K, T> {
    #[inline]
    fn key(handle: DeviceResourceHandle<K>) -> DefaultKey {
        DefaultKey::from(KeyData::from_ffi(handle.index()))
    }

    pub fn insert(&self, object: T) -> DeviceResourceHandle<K> {
        let key = self.objects.lock().insert(object);
        DeviceResourceHandle::new(key.data().as_ffi())
    }

    pub fn remove(&self, handle: DeviceResourceHandle<K>) -> Option<T> {
        let removed = self.objects.lock().remove(Self::key(handle));
        if removed.is_none() {
            log::error!("vulkan: destroy of unknown or already destroyed {:?}", handle);
        }
        removed
    }

    /// 在锁内访问对象
    pub fn with<R>(&self, handle: DeviceResourceHandle<K>, f: impl FnOnce(&T) -> R) -> Result<R, GfxError> {
        self.objects
            .lock()
            .get(Self::key(handle))
            .map(f)
            .ok_or_else(|| GfxError::invalid_parameter(format!("unknown {:?}", handle)))
    }

    pub fn with_mut<R>(&self, handle: DeviceResourceHandle<K>, f: impl FnOnce(&mut T) -> R) -> Result<R, GfxError> {
        self.objects
            .lock()
            .get_mut(Self::key(handle))
            .map(f)
            .ok_or_else(|| GfxError::invalid_parameter(format!("unknown {:?}", handle)))
    }

    /// 移除所有满足条件的对象
    pub fn drain_filter(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut objects = self.objects.lock();
        let keys = objects.iter().filter(|(_, object)| pred(object)).map(|(key, _)| key).collect::<Vec<_>>();
        keys.into_iter().filter_map(|key| objects.remove(key)).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }
}

impl<K: ResourceKind, T: Copy> ObjectTable<K, T> {
    #[inline]
    pub fn get(&self, handle: DeviceResourceHandle<K>) -> Result<T, GfxError> {
        self.with(handle, |object| *object)
    }
}

#[cfg(test)]
mod tests {
    use ze_gfx::handle::{BufferKind, RawBufferHandle};

    use super::*;

    #[test]
    fn test_stale_handle_is_rejected() {
        let table = ObjectTable::<BufferKind, u32>::default();
        let first = table.insert(1);
        assert_eq!(table.get(first), Ok(1));
        assert_eq!(table.remove(first), Some(1));

        let second = table.insert(2);
        assert_ne!(first, second);
        assert!(table.get(first).is_err());
        assert_eq!(table.get(second), Ok(2));
        assert!(table.get(RawBufferHandle::null()).is_err());
    }

    #[test]
    fn test_drain_filter() {
        let table = ObjectTable::<BufferKind, u32>::default();
        for value in 0..6 {
            table.insert(value);
        }
        let mut drained = table.drain_filter(|value| value % 2 == 0);
        drained.sort();
        assert_eq!(drained, vec![0, 2, 4]);
        assert_eq!(table.len(), 3);
    }
}
