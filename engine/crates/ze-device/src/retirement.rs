use std::collections::VecDeque;

/// 按 epoch 标记的待回收队列
///
/// 资源在逻辑上被销毁时带着当时的 epoch 入队；当某个 epoch 对应的 GPU 工作确认完成后，
/// 所有 epoch 不大于它的资源才会被取出真正释放。与 Device 的其他职责无关，可以脱离 GPU 单独测试。
pub struct RetirementQueue<T> {
    entries: VecDeque<(u64, T)>,
}

impl<T> Default for RetirementQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// new & init
impl<T> RetirementQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

// getters
impl<T> RetirementQueue<T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 最早入队的 epoch
    #[inline]
    pub fn oldest_epoch(&self) -> Option<u64> {
        self.entries.iter().map(|(epoch, _)| *epoch).min()
    }
}

// tools
impl<T> RetirementQueue<T> {
    #[inline]
    pub fn retire(&mut self, item: T, epoch: u64) {
        self.entries.push_back((epoch, item));
    }

    /// 取出所有 epoch <= completed_epoch 的项，保持入队顺序
    pub fn collect(&mut self, completed_epoch: u64) -> Vec<T> {
        // epoch 通常单调，但跨线程的 retire 可能乱序，因此不能只看队首
        let mut ready = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.entries.len());
        for (epoch, item) in self.entries.drain(..) {
            if epoch <= completed_epoch {
                ready.push(item);
            } else {
                remaining.push_back((epoch, item));
            }
        }
        self.entries = remaining;
        ready
    }

    /// 取出全部，用于 Device 销毁（此时 GPU 已经 idle）
    pub fn drain_all(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|(_, item)| item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_by_epoch() {
        let mut queue = RetirementQueue::new();
        queue.retire("a", 0);
        queue.retire("b", 1);
        queue.retire("c", 2);

        assert_eq!(queue.collect(0), vec!["a"]);
        assert_eq!(queue.len(), 2);
        assert!(queue.collect(0).is_empty());
        assert_eq!(queue.collect(5), vec!["b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_out_of_order_retire() {
        let mut queue = RetirementQueue::new();
        queue.retire(1, 3);
        queue.retire(2, 1);
        assert_eq!(queue.oldest_epoch(), Some(1));
        assert_eq!(queue.collect(1), vec![2]);
        assert_eq!(queue.collect(3), vec![1]);
    }

    #[test]
    fn test_drain_all() {
        let mut queue = RetirementQueue::new();
        queue.retire(1, 10);
        queue.retire(2, 20);
        assert_eq!(queue.drain_all(), vec![1, 2]);
        assert_eq!(queue.oldest_epoch(), None);
    }
}
