use parking_lot::Mutex;
use ze_gfx::{
    BackendDevice, GfxError,
    descriptor::DescriptorPoolCreateInfo,
    handle::{RawCommandListHandle, RawDescriptorPoolHandle, RawFenceHandle, RawSemaphoreHandle},
    types::{PipelineStage, QueueType},
};

use crate::{command_pool::ThreadedCommandPool, handles::SwapchainHandle};

/// 帧计数器
///
/// `frame_id` 一直累加，同时也是延迟销毁使用的 epoch
pub struct FrameCounter {
    frame_id: u64,
    fif_count: usize,
    /// 第一次 `new_frame` 只是启动，不推进
    started: bool,
}
// new & init
impl FrameCounter {
    pub fn new(fif_count: usize) -> Self {
        debug_assert!(fif_count > 0);
        Self {
            frame_id: 0,
            fif_count,
            started: false,
        }
    }
}
// update
impl FrameCounter {
    #[inline]
    pub fn next_frame(&mut self) {
        self.frame_id = self.frame_id.wrapping_add(1);
    }

    #[inline]
    pub fn start(&mut self) {
        self.started = true;
    }
}
// getters
impl FrameCounter {
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }
    #[inline]
    pub fn fif_count(&self) -> usize {
        self.fif_count
    }
    #[inline]
    pub fn is_started(&self) -> bool {
        self.started
    }
    /// 当前帧在 ring buffer 中的位置
    #[inline]
    pub fn frame_index(&self) -> usize {
        (self.frame_id % self.fif_count as u64) as usize
    }
    /// 复用当前 slot 时，可以确认 GPU 已经完成的 epoch
    #[inline]
    pub fn completed_epoch(&self) -> Option<u64> {
        self.frame_id.checked_sub(self.fif_count as u64)
    }
    #[inline]
    pub fn frame_label(&self) -> char {
        (b'A' + (self.frame_index() % 26) as u8) as char
    }
    #[inline]
    pub fn frame_name(&self) -> String {
        format!("[F{}{}]", self.frame_id, self.frame_label())
    }
}

/// 等待提交的 command list
#[derive(Debug, Clone)]
pub struct PendingSubmission {
    pub list: RawCommandListHandle,
    pub queue: QueueType,
    pub wait_semaphores: Vec<RawSemaphoreHandle>,
    pub wait_stages: Vec<PipelineStage>,
    pub signal_semaphores: Vec<RawSemaphoreHandle>,
}

#[derive(Default)]
pub(crate) struct FrameState {
    pub pending: Vec<PendingSubmission>,
    /// fence 已经随提交发出，复用前需要等待
    pub fence_in_flight: bool,
    pub ended: bool,
    /// 本帧 acquire 的交换链图像
    pub acquired: Option<(SwapchainHandle, u32)>,
    /// 本帧最后一次提交会 signal render_finished
    pub render_finished_pending: bool,
}

/// frame ring buffer 中的一项
pub(crate) struct Frame {
    pub index: usize,
    pub fence: RawFenceHandle,
    pub image_available: RawSemaphoreHandle,
    pub render_finished: RawSemaphoreHandle,
    pub command_pools: Vec<ThreadedCommandPool>,
    pub descriptor_pool: RawDescriptorPoolHandle,
    pub state: Mutex<FrameState>,
}

// new & init
impl Frame {
    pub fn new(backend: &dyn BackendDevice, index: usize, max_transient_sets: u32) -> Result<Self, GfxError> {
        let fence = backend.create_fence(false)?;
        let image_available = backend.create_semaphore()?;
        let render_finished = backend.create_semaphore()?;
        let descriptor_pool = backend.create_descriptor_pool(&DescriptorPoolCreateInfo::transient(max_transient_sets))?;

        Ok(Self {
            index,
            fence,
            image_available,
            render_finished,
            command_pools: [QueueType::Gfx, QueueType::Compute, QueueType::Transfer]
                .into_iter()
                .map(ThreadedCommandPool::new)
                .collect(),
            descriptor_pool,
            state: Mutex::new(FrameState::default()),
        })
    }
}

// getters
impl Frame {
    #[inline]
    pub fn command_pool(&self, queue: QueueType) -> &ThreadedCommandPool {
        match queue {
            QueueType::Gfx => &self.command_pools[0],
            QueueType::Compute => &self.command_pools[1],
            QueueType::Transfer => &self.command_pools[2],
        }
    }
}

// tools
impl Frame {
    /// 复用前的重置：command list 回到初始状态，临时 descriptor set 全部释放
    pub fn reset(&self, backend: &dyn BackendDevice) -> Result<(), GfxError> {
        for pool in &self.command_pools {
            pool.reset(backend)?;
        }
        backend.reset_descriptor_pool(self.descriptor_pool)?;

        let mut state = self.state.lock();
        state.pending.clear();
        state.acquired = None;
        state.render_finished_pending = false;
        state.ended = false;
        Ok(())
    }

    pub fn destroy(&self, backend: &dyn BackendDevice) {
        for pool in &self.command_pools {
            pool.destroy(backend);
        }
        backend.destroy_descriptor_pool(self.descriptor_pool);
        backend.destroy_semaphore(self.image_available);
        backend.destroy_semaphore(self.render_finished);
        backend.destroy_fence(self.fence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_counter() {
        let mut counter = FrameCounter::new(3);
        assert_eq!(counter.frame_index(), 0);
        assert_eq!(counter.completed_epoch(), None);
        assert_eq!(counter.frame_name(), "[F0A]");

        for _ in 0..4 {
            counter.next_frame();
        }
        assert_eq!(counter.frame_id(), 4);
        assert_eq!(counter.frame_index(), 1);
        assert_eq!(counter.frame_label(), 'B');
        assert_eq!(counter.completed_epoch(), Some(1));
    }
}
