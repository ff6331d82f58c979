//! FIFO built from fixed-size ring segments.
//!
//! Pushing into a full segment starts a new one; a drained segment is
//! dropped as soon as a newer one exists. Allocation happens once per 2047
//! items instead of on every growth step of a single large buffer.

use std::collections::VecDeque;

const SEGMENT_SIZE: usize = 2048;
const MASK: usize = SEGMENT_SIZE - 1;

struct Segment<T> {
    slots: Box<[Option<T>]>,
    bottom: usize,
    top: usize,
}

impl<T> Segment<T> {
    fn new() -> Self {
        Segment {
            slots: (0..SEGMENT_SIZE).map(|_| None).collect(),
            bottom: 0,
            top: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.top == self.bottom
    }

    fn is_full(&self) -> bool {
        ((self.top + 1) & MASK) == self.bottom
    }

    fn push(&mut self, item: T) {
        self.slots[self.top] = Some(item);
        self.top = (self.top + 1) & MASK;
    }

    fn shift(&mut self) -> Option<T> {
        let item = self.slots[self.bottom].take()?;
        self.bottom = (self.bottom + 1) & MASK;
        Some(item)
    }
}

/// Unbounded FIFO queue with O(1) amortized push and shift.
pub struct FixedQueue<T> {
    segments: VecDeque<Segment<T>>,
    len: usize,
}

impl<T> Default for FixedQueue<T> {
    fn default() -> Self {
        FixedQueue::new()
    }
}

impl<T> FixedQueue<T> {
    pub fn new() -> Self {
        let mut segments = VecDeque::with_capacity(1);
        segments.push_back(Segment::new());
        FixedQueue { segments, len: 0 }
    }

    pub fn push(&mut self, item: T) {
        if self.segments.back().is_none_or(Segment::is_full) {
            self.segments.push_back(Segment::new());
        }
        if let Some(segment) = self.segments.back_mut() {
            segment.push(item);
            self.len += 1;
        }
    }

    /// Removes and returns the oldest item.
    pub fn shift(&mut self) -> Option<T> {
        let front = self.segments.front_mut()?;
        let item = front.shift()?;
        self.len -= 1;
        if front.is_empty() && self.segments.len() > 1 {
            self.segments.pop_front();
        }
        Some(item)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut q = FixedQueue::new();
        assert!(q.is_empty());
        assert_eq!(q.shift(), None::<u32>);
        for i in 0..10 {
            q.push(i);
        }
        assert_eq!(q.len(), 10);
        for i in 0..10 {
            assert_eq!(q.shift(), Some(i));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_crosses_segments() {
        let mut q = FixedQueue::new();
        let n = SEGMENT_SIZE * 3 + 17;
        for i in 0..n {
            q.push(i);
        }
        assert_eq!(q.segments.len(), 4);
        for i in 0..n {
            assert_eq!(q.shift(), Some(i));
        }
        assert_eq!(q.shift(), None);
        assert_eq!(q.segments.len(), 1);
    }

    #[test]
    fn test_interleaved_push_shift() {
        let mut q = FixedQueue::new();
        let mut next_out = 0;
        let mut next_in = 0;
        for round in 0..5000 {
            q.push(next_in);
            next_in += 1;
            if round % 3 != 0 {
                assert_eq!(q.shift(), Some(next_out));
                next_out += 1;
            }
        }
        while let Some(v) = q.shift() {
            assert_eq!(v, next_out);
            next_out += 1;
        }
        assert_eq!(next_out, next_in);
    }
}
