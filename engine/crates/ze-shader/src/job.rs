//! 后台任务系统
//!
//! 基于 rayon 线程池：工作线程之间互相窃取任务，没有任务时挂起。
//! 等待任务结果时阻塞在 channel 上，而不是忙等。

use crossbeam_channel::{Receiver, TryRecvError};
use crossbeam_utils::sync::WaitGroup;

use crate::error::ShaderError;

pub struct JobSystem {
    pool: rayon::ThreadPool,
}

// new & init
impl JobSystem {
    /// `num_threads` 为 0 时使用 CPU 核心数
    pub fn new(num_threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("ze-job-{}", index))
            .panic_handler(|_| log::error!("job panicked, its result is dropped"))
            .build()?;
        log::info!("job system started with {} threads", pool.current_num_threads());
        Ok(Self { pool })
    }
}

// getters
impl JobSystem {
    #[inline]
    pub fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }
}

// tools
impl JobSystem {
    /// 在线程池中执行一个任务
    pub fn spawn<T, F>(&self, job: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        self.pool.spawn(move || {
            let _ = sender.send(job());
        });
        JobHandle { receiver }
    }

    /// 一组任务，全部完成后一起取得结果
    pub fn spawn_group<T, F>(&self, jobs: impl IntoIterator<Item = F>) -> JobGroup<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let wait_group = WaitGroup::new();
        let (sender, receiver) = crossbeam_channel::unbounded();

        let mut len = 0;
        for (index, job) in jobs.into_iter().enumerate() {
            let sender = sender.clone();
            let wait_group = wait_group.clone();
            self.pool.spawn(move || {
                let _ = sender.send((index, job()));
                drop(wait_group);
            });
            len += 1;
        }

        JobGroup {
            wait_group,
            receiver,
            len,
        }
    }
}

/// 单个任务的结果
pub struct JobHandle<T> {
    receiver: Receiver<T>,
}

impl<T> JobHandle<T> {
    /// 阻塞直到任务完成
    pub fn wait(self) -> Result<T, ShaderError> {
        self.receiver.recv().map_err(|_| ShaderError::JobCanceled)
    }

    /// 任务已经完成时取得结果，否则把 handle 交还
    pub fn try_get(self) -> Result<Result<T, ShaderError>, Self> {
        match self.receiver.try_recv() {
            Ok(value) => Ok(Ok(value)),
            Err(TryRecvError::Disconnected) => Ok(Err(ShaderError::JobCanceled)),
            Err(TryRecvError::Empty) => Err(self),
        }
    }
}

/// 一组任务的结果，按提交顺序排列
pub struct JobGroup<T> {
    wait_group: WaitGroup,
    receiver: Receiver<(usize, T)>,
    len: usize,
}

impl<T> JobGroup<T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 阻塞直到组内所有任务结束；任何一个任务没有产出结果时返回 `JobCanceled`
    pub fn wait(self) -> Result<Vec<T>, ShaderError> {
        self.wait_group.wait();

        let mut results = self.receiver.try_iter().collect::<Vec<_>>();
        if results.len() != self.len {
            return Err(ShaderError::JobCanceled);
        }
        results.sort_by_key(|(index, _)| *index);
        Ok(results.into_iter().map(|(_, value)| value).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn test_spawn_and_wait() {
        let jobs = JobSystem::new(2).unwrap();
        assert_eq!(jobs.thread_count(), 2);

        let handle = jobs.spawn(|| 6 * 7);
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn test_try_get_eventually_ready() {
        let jobs = JobSystem::new(1).unwrap();
        let (gate_sender, gate) = crossbeam_channel::bounded::<()>(0);
        let mut handle = jobs.spawn(move || {
            let _ = gate.recv();
            "done"
        });

        handle = match handle.try_get() {
            Ok(_) => panic!("job finished before the gate opened"),
            Err(handle) => handle,
        };
        gate_sender.send(()).unwrap();
        assert_eq!(handle.wait().unwrap(), "done");
    }

    #[test]
    fn test_group_keeps_submission_order() {
        let jobs = JobSystem::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let group = jobs.spawn_group((0..16).map(|i| {
            let counter = counter.clone();
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                i * 2
            }
        }));
        assert_eq!(group.len(), 16);

        let results = group.wait().unwrap();
        assert_eq!(results, (0..16).map(|i| i * 2).collect::<Vec<_>>());
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_panicking_job_is_canceled() {
        let jobs = JobSystem::new(1).unwrap();
        let handle = jobs.spawn(|| -> u32 { panic!("boom") });
        assert!(matches!(handle.wait(), Err(ShaderError::JobCanceled)));

        let group_jobs: [fn() -> u32; 2] = [|| 1, || panic!("boom")];
        let group = jobs.spawn_group(group_jobs);
        assert!(matches!(group.wait(), Err(ShaderError::JobCanceled)));
    }
}
