//! Bounded queue for document updates sent while disconnected.
//!
//! Queued updates are replayed in order on reconnect. When full, the oldest
//! entry is dropped; its writes come back with the full-state push of the
//! reconnect handshake.

use std::collections::VecDeque;

/// Default number of queued updates per transport.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct OutboundQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            dropped: 0,
        }
    }

    /// Queue an update. Returns the evicted oldest entry on overflow.
    pub fn push(&mut self, payload: Vec<u8>) -> Option<Vec<u8>> {
        let evicted = if self.queue.len() >= self.max_size {
            self.dropped += 1;
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(payload);
        evicted
    }

    /// Drain all queued updates, oldest first.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Updates evicted by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOUND_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_queue() {
        let mut queue = OutboundQueue::new(100);
        assert!(queue.is_empty());

        queue.push(vec![1, 2, 3]);
        queue.push(vec![4, 5, 6, 7]);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained, vec![vec![1, 2, 3], vec![4, 5, 6, 7]]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut queue = OutboundQueue::new(3);

        assert_eq!(queue.push(vec![1]), None);
        assert_eq!(queue.push(vec![2]), None);
        assert_eq!(queue.push(vec![3]), None);
        assert_eq!(queue.push(vec![4]), Some(vec![1]));
        assert_eq!(queue.push(vec![5]), Some(vec![2]));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.drain(), vec![vec![3], vec![4], vec![5]]);
    }

    #[test]
    fn test_clear() {
        let mut queue = OutboundQueue::default();
        queue.push(vec![1]);
        queue.push(vec![2]);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), DEFAULT_OUTBOUND_CAPACITY);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut queue = OutboundQueue::new(0);
        queue.push(vec![1]);
        queue.push(vec![2]);
        assert_eq!(queue.drain(), vec![vec![2]]);
    }
}
