//! Lock-free stack of free indices.
//!
//! Index-based Treiber stack: the head word packs a 32-bit ABA tag above
//! the 32-bit top index, and each index links to the next through a side
//! array. Many threads may pop and push at once.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// End-of-list marker
pub const NIL: u32 = u32::MAX;

#[inline]
fn pack(tag: u64, index: u32) -> u64 {
    (tag << 32) | index as u64
}

#[inline]
fn next_tag(head: u64) -> u64 {
    ((head >> 32) + 1) & 0xffff_ffff
}

/// Concurrent free-list over `0..capacity`
pub struct FreeList {
    head: AtomicU64,
    next: Box<[AtomicU32]>,
    available: AtomicUsize,
}

impl FreeList {
    /// List holding every index, popping in ascending order
    pub fn full(capacity: usize) -> Self {
        let mut list = Self {
            head: AtomicU64::new(pack(0, NIL)),
            next: (0..capacity).map(|_| AtomicU32::new(NIL)).collect(),
            available: AtomicUsize::new(0),
        };
        list.refill();
        list
    }

    /// Total number of indices managed
    pub fn capacity(&self) -> usize {
        self.next.len()
    }

    /// Indices currently free. Exact when no pop/push is in flight; the
    /// counter trails the head CAS, so a racing read is clamped to
    /// `0..=capacity`.
    pub fn len(&self) -> usize {
        let available = self.available.load(Ordering::Relaxed);
        // A pop counted before its matching push wraps below zero
        if available > self.capacity() { 0 } else { available }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take a free index
    pub fn pop(&self) -> Option<u32> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let index = head as u32;
            if index == NIL {
                return None;
            }
            // May be stale if another thread pops and re-pushes `index`
            // meanwhile; the tag bump makes the CAS fail in that case.
            let next = self.next[index as usize].load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(next_tag(head), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.available.fetch_sub(1, Ordering::Relaxed);
                    return Some(index);
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Return an index. The caller must own it (popped and not yet pushed).
    pub fn push(&self, index: u32) {
        debug_assert!((index as usize) < self.capacity(), "index {} out of range", index);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            self.next[index as usize].store(head as u32, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(next_tag(head), index),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.available.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Mark every index free again
    pub fn refill(&mut self) {
        let capacity = self.next.len();
        for (i, link) in self.next.iter_mut().enumerate() {
            *link.get_mut() = if i + 1 < capacity { (i + 1) as u32 } else { NIL };
        }
        let top = if capacity == 0 { NIL } else { 0 };
        *self.head.get_mut() = pack(0, top);
        *self.available.get_mut() = capacity;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_pops_in_order_then_empty() {
        let list = FreeList::full(3);
        assert_eq!(list.pop(), Some(0));
        assert_eq!(list.pop(), Some(1));
        assert_eq!(list.pop(), Some(2));
        assert_eq!(list.pop(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_zero_capacity() {
        let list = FreeList::full(0);
        assert_eq!(list.pop(), None);
        assert_eq!(list.capacity(), 0);
    }

    #[test]
    fn test_push_is_lifo() {
        let list = FreeList::full(4);
        let a = list.pop().unwrap();
        let b = list.pop().unwrap();
        list.push(a);
        list.push(b);
        assert_eq!(list.pop(), Some(b));
        assert_eq!(list.pop(), Some(a));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_concurrent_pops_are_unique() {
        let list = FreeList::full(10_000);
        let popped: Vec<u32> = (0..12_000)
            .into_par_iter()
            .filter_map(|_| list.pop())
            .collect();
        assert_eq!(popped.len(), 10_000);
        let unique: HashSet<u32> = popped.iter().copied().collect();
        assert_eq!(unique.len(), 10_000);
        assert!(list.is_empty());
    }

    #[test]
    fn test_concurrent_pop_push_churn() {
        let list = FreeList::full(64);
        (0..20_000).into_par_iter().for_each(|_| {
            if let Some(index) = list.pop() {
                list.push(index);
            }
        });
        assert_eq!(list.len(), 64);

        let mut drained: Vec<u32> = std::iter::from_fn(|| list.pop()).collect();
        drained.sort_unstable();
        assert_eq!(drained, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_refill() {
        let mut list = FreeList::full(5);
        while list.pop().is_some() {}
        list.refill();
        assert_eq!(list.len(), 5);
        assert_eq!(list.pop(), Some(0));
    }
}
