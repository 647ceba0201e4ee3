use parking_lot::Mutex;
use slotmap::{Key, SlotMap};

/// 线程安全的资源池
///
/// 资源可能在加载线程或 job 线程中创建，渲染线程同时在录制命令，所以每个池都带一把锁。
/// 句柄是 slot + generation，slot 复用后旧句柄 `contains` 返回 false。
pub struct ResourcePool<K: Key, V> {
    name: &'static str,
    slots: Mutex<SlotMap<K, V>>,
}

// new & init
impl<K: Key, V> ResourcePool<K, V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Mutex::new(SlotMap::with_key()),
        }
    }
}

// getters
impl<K: Key, V> ResourcePool<K, V> {
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    #[inline]
    pub fn contains(&self, key: K) -> bool {
        self.slots.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.slots.lock().keys().collect()
    }
}

// tools
impl<K: Key, V> ResourcePool<K, V> {
    #[inline]
    pub fn insert(&self, value: V) -> K {
        self.slots.lock().insert(value)
    }

    #[inline]
    pub fn remove(&self, key: K) -> Option<V> {
        self.slots.lock().remove(key)
    }

    /// 在持锁期间访问资源；句柄失效时返回 None
    #[inline]
    pub fn with<R>(&self, key: K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.slots.lock().get(key).map(f)
    }

    #[inline]
    pub fn with_mut<R>(&self, key: K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.slots.lock().get_mut(key).map(f)
    }

    /// 取出所有资源，用于 Device 销毁
    pub fn drain(&self) -> Vec<(K, V)> {
        self.slots.lock().drain().collect()
    }
}

impl<K: Key, V: Clone> ResourcePool<K, V> {
    #[inline]
    pub fn get_cloned(&self, key: K) -> Option<V> {
        self.slots.lock().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::new_key_type;

    new_key_type! {
        struct TestKey;
    }

    #[test]
    fn test_stale_key_after_slot_reuse() {
        let pool = ResourcePool::<TestKey, u32>::new("test");
        let first = pool.insert(1);
        assert!(pool.contains(first));
        assert_eq!(pool.remove(first), Some(1));

        // slot 被复用，但 generation 不同
        let second = pool.insert(2);
        assert!(!pool.contains(first));
        assert!(pool.contains(second));
        assert_eq!(pool.with(first, |v| *v), None);
        assert_eq!(pool.with(second, |v| *v), Some(2));
    }

    #[test]
    fn test_concurrent_insert() {
        let pool = std::sync::Arc::new(ResourcePool::<TestKey, usize>::new("test"));
        let threads = (0..4)
            .map(|t| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        pool.insert(t * 100 + i);
                    }
                })
            })
            .collect::<Vec<_>>();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(pool.len(), 400);
        assert_eq!(pool.drain().len(), 400);
        assert!(pool.is_empty());
    }
}
