use std::{collections::HashMap, thread::ThreadId};

use parking_lot::Mutex;
use ze_gfx::{
    BackendDevice, GfxError,
    handle::{RawCommandListHandle, RawCommandPoolHandle},
    types::QueueType,
};

struct ThreadCommandPool {
    pool: RawCommandPoolHandle,
    lists: Vec<RawCommandListHandle>,
    /// lists 中尚未在本轮使用的起始位置，reset 后归零
    next_free: usize,
}

/// 按线程划分的 command pool
///
/// command pool 不能被多个线程同时使用，所以每个录制线程第一次分配时懒创建一个后端 pool。
/// 各线程只操作自己的 command list，互不干扰。
pub struct ThreadedCommandPool {
    queue: QueueType,
    pools: Mutex<HashMap<ThreadId, ThreadCommandPool>>,
}

// new & init
impl ThreadedCommandPool {
    pub fn new(queue: QueueType) -> Self {
        Self {
            queue,
            pools: Mutex::new(HashMap::new()),
        }
    }
}

// getters
impl ThreadedCommandPool {
    #[inline]
    pub fn queue(&self) -> QueueType {
        self.queue
    }

    /// 已经创建的后端 pool 数量，即使用过它的线程数
    #[inline]
    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }
}

// tools
impl ThreadedCommandPool {
    /// 为当前线程分配一个 command list，reset 之后会复用之前分配过的
    pub fn allocate(&self, backend: &dyn BackendDevice) -> Result<RawCommandListHandle, GfxError> {
        let thread_id = std::thread::current().id();
        let mut pools = self.pools.lock();

        let entry = match pools.entry(thread_id) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let pool = backend.create_command_pool(self.queue)?;
                log::debug!("command pool {:?} created for thread {:?}", pool, thread_id);
                e.insert(ThreadCommandPool {
                    pool,
                    lists: Vec::new(),
                    next_free: 0,
                })
            }
        };

        let list = match entry.lists.get(entry.next_free) {
            Some(list) => *list,
            None => {
                let list = backend.allocate_command_list(entry.pool)?;
                entry.lists.push(list);
                list
            }
        };
        entry.next_free += 1;
        Ok(list)
    }

    /// 所有线程的 command list 回到初始状态
    ///
    /// 只能在这些 command list 的 GPU 工作完成之后调用
    pub fn reset(&self, backend: &dyn BackendDevice) -> Result<(), GfxError> {
        for entry in self.pools.lock().values_mut() {
            if entry.next_free == 0 {
                continue;
            }
            backend.reset_command_pool(entry.pool)?;
            entry.next_free = 0;
        }
        Ok(())
    }

    pub fn destroy(&self, backend: &dyn BackendDevice) {
        for (_, entry) in self.pools.lock().drain() {
            backend.destroy_command_pool(entry.pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ze_gfx::{
        DeviceResourceType,
        headless::{BackendCall, HeadlessBackendDevice},
    };

    use super::*;

    #[test]
    fn test_one_pool_per_thread() {
        let backend = Arc::new(HeadlessBackendDevice::new());
        let pool = Arc::new(ThreadedCommandPool::new(QueueType::Gfx));

        pool.allocate(backend.as_ref()).unwrap();
        pool.allocate(backend.as_ref()).unwrap();
        assert_eq!(pool.pool_count(), 1);

        let (pool2, backend2) = (pool.clone(), backend.clone());
        std::thread::spawn(move || {
            pool2.allocate(backend2.as_ref()).unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(pool.pool_count(), 2);
        assert_eq!(backend.live_count(DeviceResourceType::CommandPool), 2);

        pool.destroy(backend.as_ref());
        assert_eq!(backend.live_count(DeviceResourceType::CommandPool), 0);
    }

    #[test]
    fn test_reset_reuses_lists() {
        let backend = HeadlessBackendDevice::new();
        let pool = ThreadedCommandPool::new(QueueType::Gfx);

        let a = pool.allocate(&backend).unwrap();
        let b = pool.allocate(&backend).unwrap();
        assert_ne!(a, b);

        pool.reset(&backend).unwrap();
        assert!(backend.position(|c| matches!(c, BackendCall::ResetCommandPool(_))).is_some());
        assert_eq!(pool.allocate(&backend).unwrap(), a);
        assert_eq!(pool.allocate(&backend).unwrap(), b);
        assert_eq!(backend.live_count(DeviceResourceType::CommandList), 2);

        pool.destroy(&backend);
    }
}
