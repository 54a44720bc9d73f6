use std::collections::VecDeque;

/// Where a queued item goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Appended behind everything already queued.
    #[default]
    Normal,
    /// Jumps the line: inserted at the front.
    Quality,
}

/// Bounded outgoing queue.
///
/// Once `limit` items are queued, every push first evicts the oldest item
/// (the front). A quality push is then placed at the front, so under
/// overflow it displaces the oldest entry rather than itself.
#[derive(Debug)]
pub struct OutgoingQueue<T> {
    items: VecDeque<T>,
    limit: usize,
    dropped: u64,
}

impl<T> OutgoingQueue<T> {
    /// A queue holding at most `limit` items (a zero limit holds one).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            items: VecDeque::with_capacity(limit.min(64)),
            limit,
            dropped: 0,
        }
    }

    /// Enqueue `item`. Returns the evicted item, if the queue was full.
    pub fn push(&mut self, item: T, priority: Priority) -> Option<T> {
        let evicted = if self.items.len() >= self.limit {
            self.dropped += 1;
            self.items.pop_front()
        } else {
            None
        };
        match priority {
            Priority::Normal => self.items.push_back(item),
            Priority::Quality => self.items.push_front(item),
        }
        evicted
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Put back an item taken with `pop_front` that could not be delivered.
    /// Does not evict: the item already counted against the limit.
    pub fn restore_front(&mut self, item: T) {
        self.items.push_front(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Total number of items evicted by overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(q: &mut OutgoingQueue<u32>) -> Vec<u32> {
        std::iter::from_fn(|| q.pop_front()).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut q = OutgoingQueue::new(8);
        for i in 0..4 {
            assert!(q.push(i, Priority::Normal).is_none());
        }
        assert_eq!(drain(&mut q), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_quality_goes_first() {
        let mut q = OutgoingQueue::new(8);
        q.push(1, Priority::Normal);
        q.push(2, Priority::Normal);
        q.push(9, Priority::Quality);
        assert_eq!(drain(&mut q), vec![9, 1, 2]);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut q = OutgoingQueue::new(3);
        q.push(1, Priority::Normal);
        q.push(2, Priority::Normal);
        q.push(3, Priority::Normal);
        assert_eq!(q.push(4, Priority::Normal), Some(1));
        assert_eq!(q.push(5, Priority::Quality), Some(2));
        assert_eq!(q.len(), 3);
        assert_eq!(q.dropped(), 2);
        assert_eq!(drain(&mut q), vec![5, 3, 4]);
    }

    #[test]
    fn test_restore_front_keeps_position() {
        let mut q = OutgoingQueue::new(2);
        q.push(1, Priority::Normal);
        q.push(2, Priority::Normal);
        let head = q.pop_front().unwrap();
        q.restore_front(head);
        assert_eq!(q.front(), Some(&1));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_zero_limit_holds_one() {
        let mut q = OutgoingQueue::new(0);
        q.push(1, Priority::Normal);
        assert_eq!(q.push(2, Priority::Normal), Some(1));
        assert_eq!(q.limit(), 1);
    }
}
