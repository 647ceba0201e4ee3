use ze_gfx::{
    DeviceResourceType, GfxResult,
    types::{PipelineStage, QueueType},
};

use super::Device;
use crate::{
    command_list::CommandList,
    error::DeviceError,
    frame::{Frame, FrameState, PendingSubmission},
    handles::{SemaphoreHandle, SwapchainHandle},
};

// Frame lifecycle API
impl Device {
    /// 进入下一帧
    ///
    /// 第一次调用只是启动帧循环。之后每次调用：如果当前帧还没有 `end_frame` 就先提交它；
    /// 然后等待即将复用的帧的 fence，释放 `max_frames_in_flight` 帧之前退休的资源，重置该帧的 command pool。
    /// fence 等待失败时帧号不会推进，可以重试。
    pub fn new_frame(&self) -> Result<(), DeviceError> {
        let _span = tracy_client::span!("Device::new_frame");
        let backend = self.backend.as_ref();

        {
            let mut counter = self.frame_counter.lock();
            if !counter.is_started() {
                counter.start();
                log::info!("frame loop started, {} frames in flight", counter.fif_count());
                return Ok(());
            }
        }

        if !self.current_frame().state.lock().ended {
            self.end_frame()?;
        }

        let next_index = {
            let counter = self.frame_counter.lock();
            ((counter.frame_id() + 1) % counter.fif_count() as u64) as usize
        };
        let frame = &self.frames[next_index];

        if frame.state.lock().fence_in_flight {
            let _span = tracy_client::span!("wait frame fence");
            let result = backend.wait_for_fences(&[frame.fence], true, self.settings.fence_timeout_ns);
            if result != GfxResult::Success {
                log::warn!("{} fence wait returned {:?}", self.frame_name(), result);
                return Err(DeviceError::FenceWait(result));
            }
            backend.reset_fences(&[frame.fence])?;
            frame.state.lock().fence_in_flight = false;
        }

        let completed_epoch = {
            let mut counter = self.frame_counter.lock();
            counter.next_frame();
            counter.completed_epoch()
        };
        if let Some(completed_epoch) = completed_epoch {
            self.collect_retired(completed_epoch);
        }
        frame.reset(backend)?;
        Ok(())
    }

    /// 提交当前帧所有待提交的 command list，最后一次提交 signal 帧的 fence
    ///
    /// 本帧 acquire 过交换链图像时，第一次提交等待 image_available，最后一次提交 signal render_finished
    pub fn end_frame(&self) -> Result<(), DeviceError> {
        let _span = tracy_client::span!("Device::end_frame");
        let frame = self.current_frame();
        let mut state = frame.state.lock();
        if state.ended {
            log::warn!("{} already ended", self.frame_name());
            return Ok(());
        }

        let present_sync = state.acquired.is_some();
        self.submit_pending(frame, &mut state, present_sync)?;
        state.render_finished_pending = present_sync;
        state.ended = true;
        Ok(())
    }

    /// 把所有待提交的工作提交到 GPU 并等待完成，之后可以继续在本帧录制
    pub fn flush(&self) -> Result<(), DeviceError> {
        let _span = tracy_client::span!("Device::flush");
        let frame = self.current_frame();
        {
            let mut state = frame.state.lock();
            if state.ended {
                return self.wait_idle();
            }
            self.submit_pending(frame, &mut state, false)?;
        }

        self.backend.wait_idle()?;
        self.backend.reset_fences(&[frame.fence])?;
        frame.state.lock().fence_in_flight = false;

        // GPU 已经空闲，所有退休的资源都可以释放
        let retired = self.retired.lock().drain_all();
        for item in retired {
            self.free_retired(item);
        }
        Ok(())
    }

    fn submit_pending(&self, frame: &Frame, state: &mut FrameState, present_sync: bool) -> Result<(), DeviceError> {
        let backend = self.backend.as_ref();

        // descriptor 的写入必须在引用它们的提交之前生效
        self.bindless.flush_updates(backend);

        let mut pending = std::mem::take(&mut state.pending);
        if pending.is_empty() {
            // 没有录制任何命令时也要提交，fence 才会被 signal
            pending.push(PendingSubmission {
                list: Default::default(),
                queue: QueueType::Gfx,
                wait_semaphores: vec![],
                wait_stages: vec![],
                signal_semaphores: vec![],
            });
        }

        let count = pending.len();
        for (i, mut submission) in pending.into_iter().enumerate() {
            if present_sync && i == 0 {
                submission.wait_semaphores.push(frame.image_available);
                submission.wait_stages.push(PipelineStage::COLOR_ATTACHMENT_OUTPUT);
            }
            let is_last = i + 1 == count;
            if present_sync && is_last {
                submission.signal_semaphores.push(frame.render_finished);
            }

            let lists = if submission.list.is_null() { vec![] } else { vec![submission.list] };
            backend.queue_submit(
                submission.queue,
                &lists,
                &submission.wait_semaphores,
                &submission.wait_stages,
                &submission.signal_semaphores,
                is_last.then_some(frame.fence),
            )?;
        }
        state.fence_in_flight = true;
        Ok(())
    }

    /// 结束录制，放入当前帧的提交列表，在 `end_frame` 时真正提交
    pub fn submit(
        &self,
        cmd: CommandList,
        wait_semaphores: &[SemaphoreHandle],
        signal_semaphores: &[SemaphoreHandle],
    ) -> Result<(), DeviceError> {
        if cmd.is_in_render_pass() {
            log::error!("command list {:?} submitted inside a render pass", cmd.raw);
            self.backend.cmd_end_render_pass(cmd.raw);
        }
        let waits = self.raw_semaphores(wait_semaphores)?;
        let signals = self.raw_semaphores(signal_semaphores)?;
        self.backend.end_command_list(cmd.raw)?;

        let frame = &self.frames[cmd.frame_index];
        debug_assert_eq!(cmd.epoch, self.frame_id(), "command list submitted in a later frame");
        frame.state.lock().pending.push(PendingSubmission {
            list: cmd.raw,
            queue: cmd.queue,
            wait_stages: vec![PipelineStage::ALL_COMMANDS; waits.len()],
            wait_semaphores: waits,
            signal_semaphores: signals,
        });
        Ok(())
    }

    /// 阻塞直到 GPU 空闲
    pub fn wait_idle(&self) -> Result<(), DeviceError> {
        let _span = tracy_client::span!("Device::wait_idle");
        Ok(self.backend.wait_idle()?)
    }
}

// Present API
impl Device {
    /// 获取下一张交换链图像，signal 当前帧的 image_available
    ///
    /// 返回的 image index 只在 `Success` 时有意义
    pub fn acquire_swapchain_image(&self, swapchain: SwapchainHandle) -> Result<(GfxResult, u32), DeviceError> {
        let _span = tracy_client::span!("Device::acquire_swapchain_image");
        let raw = self
            .swapchains
            .with(swapchain, |entry| entry.raw)
            .ok_or(DeviceError::invalid_handle(DeviceResourceType::Swapchain))?;

        let frame = self.current_frame();
        let (result, image_index) =
            self.backend.acquire_swapchain_image(raw, Some(frame.image_available), self.settings.fence_timeout_ns);
        if result == GfxResult::Success {
            frame.state.lock().acquired = Some((swapchain, image_index));
        } else {
            log::warn!("{} acquire swapchain image returned {:?}", self.frame_name(), result);
        }
        Ok((result, image_index))
    }

    /// 呈现本帧 acquire 的图像，需要在 `end_frame` 之后调用
    pub fn present(&self, swapchain: SwapchainHandle, wait_semaphores: &[SemaphoreHandle]) -> Result<GfxResult, DeviceError> {
        let _span = tracy_client::span!("Device::present");
        let raw = self
            .swapchains
            .with(swapchain, |entry| entry.raw)
            .ok_or(DeviceError::invalid_handle(DeviceResourceType::Swapchain))?;

        let frame = self.current_frame();
        let (image_index, render_finished) = {
            let state = frame.state.lock();
            match state.acquired {
                Some((acquired, image_index)) if acquired == swapchain => {
                    (image_index, state.render_finished_pending.then_some(frame.render_finished))
                }
                _ => {
                    log::error!("{} present without an acquired image", self.frame_name());
                    return Ok(GfxResult::ErrorInvalidParameter);
                }
            }
        };
        if render_finished.is_none() {
            log::warn!("{} present before end_frame", self.frame_name());
        }

        let mut waits = self.raw_semaphores(wait_semaphores)?;
        waits.extend(render_finished);
        Ok(self.backend.present(QueueType::Gfx, raw, image_index, &waits))
    }
}
