//! Bounded FIFO of device-rate sample buffers awaiting scheduling.
//!
//! Overflow drops the oldest buffers rather than rejecting the new one: under
//! sustained overload recent speech matters more than continuity.

use std::collections::VecDeque;

/// Record of one drop-oldest event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow {
    pub dropped: usize,
    pub retained: usize,
}

#[derive(Debug)]
pub struct PlaybackQueue {
    buffers: VecDeque<Vec<f32>>,
    capacity: usize,
    retain: usize,
}

impl PlaybackQueue {
    /// `capacity` is the maximum length; `retain` is how many of the newest
    /// buffers survive an overflow. Both are at least 1 and `retain <= capacity`.
    pub fn new(capacity: usize, retain: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffers: VecDeque::with_capacity(capacity + 1),
            capacity,
            retain: retain.clamp(1, capacity),
        }
    }

    /// Append `buffer`. If that pushes the queue past capacity, drop the oldest
    /// buffers until `retain` remain (the new buffer is always kept).
    pub fn push(&mut self, buffer: Vec<f32>) -> Option<Overflow> {
        self.buffers.push_back(buffer);
        if self.buffers.len() <= self.capacity {
            return None;
        }
        let dropped = self.buffers.len() - self.retain;
        self.buffers.drain(..dropped);
        Some(Overflow {
            dropped,
            retained: self.buffers.len(),
        })
    }

    pub fn pop(&mut self) -> Option<Vec<f32>> {
        self.buffers.pop_front()
    }

    /// Empty the queue, returning how many buffers were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.buffers.len();
        self.buffers.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(i: usize) -> Vec<f32> {
        vec![i as f32]
    }

    #[test]
    fn fifo_order() {
        let mut q = PlaybackQueue::new(10, 5);
        for i in 0..3 {
            assert!(q.push(marker(i)).is_none());
        }
        assert_eq!(q.pop(), Some(marker(0)));
        assert_eq!(q.pop(), Some(marker(1)));
        assert_eq!(q.pop(), Some(marker(2)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn overflow_keeps_newest_half() {
        let mut q = PlaybackQueue::new(4, 2);
        for i in 0..4 {
            assert!(q.push(marker(i)).is_none());
        }
        let overflow = q.push(marker(4)).expect("fifth push overflows");
        assert_eq!(
            overflow,
            Overflow {
                dropped: 3,
                retained: 2
            }
        );
        assert_eq!(q.pop(), Some(marker(3)));
        assert_eq!(q.pop(), Some(marker(4)));
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut q = PlaybackQueue::new(7, 3);
        for i in 0..1_000 {
            q.push(marker(i));
            assert!(q.len() <= q.capacity());
        }
    }

    #[test]
    fn clear_reports_discarded() {
        let mut q = PlaybackQueue::new(10, 5);
        q.push(marker(0));
        q.push(marker(1));
        assert_eq!(q.clear(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn degenerate_sizes_are_clamped() {
        let mut q = PlaybackQueue::new(0, 0);
        assert_eq!(q.capacity(), 1);
        q.push(marker(0));
        let overflow = q.push(marker(1)).expect("second push overflows");
        assert_eq!(overflow.retained, 1);
        assert_eq!(q.pop(), Some(marker(1)));
    }
}
