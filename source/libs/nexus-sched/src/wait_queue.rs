// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bounded max-heap of runnable entities awaiting the CPU
//! OWNERS: @kernel-sched-team
//! INVARIANTS:
//!   - Root is the highest priority, then most owed, then longest queued
//!   - Keys are frozen on insertion; waiting does not reorder entries

use core::cmp::Ordering;

use nexus_hal::CpuId;

use crate::config::MAX_ENTITIES;
use crate::entity::{EntityHandle, Priority};
use crate::progress::{serial_cmp, FairnessKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueEntry {
    pub handle: EntityHandle,
    pub priority: Priority,
    pub key: FairnessKey,
    pub seq: u64,
}

impl QueueEntry {
    const VACANT: Self = Self {
        handle: EntityHandle::new(CpuId::BOOT, u16::MAX, 0),
        priority: Priority::MIN,
        key: FairnessKey::ZERO,
        seq: 0,
    };

    fn ranks_before(&self, other: &Self) -> bool {
        match self.priority.cmp(&other.priority) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match self.key.owed_cmp(&other.key) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => serial_cmp(self.seq, other.seq) == Ordering::Less,
            },
        }
    }
}

pub(crate) struct WaitQueue {
    entries: [QueueEntry; MAX_ENTITIES],
    len: usize,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self { entries: [QueueEntry::VACANT; MAX_ENTITIES], len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn peek(&self) -> Option<&QueueEntry> {
        self.as_slice().first()
    }

    pub fn as_slice(&self) -> &[QueueEntry] {
        &self.entries[..self.len]
    }

    /// Returns `false` when the heap is full.
    #[must_use]
    pub fn push(&mut self, entry: QueueEntry) -> bool {
        if self.len == MAX_ENTITIES {
            return false;
        }
        self.entries[self.len] = entry;
        self.len += 1;
        self.sift_up(self.len - 1);
        true
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        if self.len == 0 {
            return None;
        }
        let top = self.entries[0];
        self.len -= 1;
        if self.len > 0 {
            self.entries[0] = self.entries[self.len];
            self.sift_down(0);
        }
        self.entries[self.len] = QueueEntry::VACANT;
        Some(top)
    }

    /// First index whose entry outranks its parent, if any.
    pub fn heap_violation(&self) -> Option<usize> {
        (1..self.len).find(|&i| self.entries[i].ranks_before(&self.entries[(i - 1) / 2]))
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.entries[i].ranks_before(&self.entries[parent]) {
                break;
            }
            self.entries.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let mut best = i;
            for child in [2 * i + 1, 2 * i + 2] {
                if child < self.len && self.entries[child].ranks_before(&self.entries[best]) {
                    best = child;
                }
            }
            if best == i {
                return;
            }
            self.entries.swap(i, best);
            i = best;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{Progress, Unfairness};

    fn keyed(slot: u16, priority: Priority, key: FairnessKey, seq: u64) -> QueueEntry {
        QueueEntry { handle: EntityHandle::new(CpuId::BOOT, slot, 1), priority, key, seq }
    }

    fn entry(slot: u16, priority: Priority, owed: i64, seq: u64) -> QueueEntry {
        keyed(slot, priority, FairnessKey { base: Unfairness::from_raw(owed), reference: Progress::ZERO }, seq)
    }

    fn drain(queue: &mut WaitQueue) -> Vec<u16> {
        core::iter::from_fn(|| queue.pop()).map(|e| e.handle.slot()).collect()
    }

    #[test]
    fn priority_dominates_fairness() {
        let mut q = WaitQueue::new();
        assert!(q.push(entry(0, 0, 1_000_000, 0)));
        assert!(q.push(entry(1, 2, 0, 1)));
        assert!(q.push(entry(2, 1, 500, 2)));
        assert_eq!(drain(&mut q), vec![1, 2, 0]);
    }

    #[test]
    fn equal_keys_pop_fifo() {
        let mut q = WaitQueue::new();
        for slot in 0..8 {
            assert!(q.push(entry(slot, 0, 42, u64::from(slot))));
        }
        assert_eq!(drain(&mut q), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn earliest_arrival_pops_first_across_progress_wrap() {
        let at = |raw| FairnessKey { base: Unfairness::ZERO, reference: Progress::from_raw(raw) };
        let mut q = WaitQueue::new();
        assert!(q.push(keyed(0, 0, at(u64::MAX - 5), 0)));
        assert!(q.push(keyed(1, 0, at(3), 1)));
        assert!(q.push(keyed(2, 0, at(u64::MAX - 9), 2)));
        assert_eq!(drain(&mut q), vec![2, 0, 1]);
    }

    #[test]
    fn saturated_credit_stays_on_top() {
        let mut q = WaitQueue::new();
        let rich = FairnessKey { base: Unfairness::MAX, reference: Progress::ZERO };
        let late = FairnessKey { base: Unfairness::from_raw(853_333_333), reference: Progress::from_raw(1_280_000_000) };
        assert!(q.push(keyed(1, 0, late, 0)));
        assert!(q.push(keyed(0, 0, rich, 1)));
        assert_eq!(drain(&mut q), vec![0, 1]);
    }

    #[test]
    fn full_queue_rejects_push() {
        let mut q = WaitQueue::new();
        for slot in 0..MAX_ENTITIES as u16 {
            assert!(q.push(entry(slot, 0, i64::from(slot) * 7 % 13, u64::from(slot))));
            assert_eq!(q.heap_violation(), None);
        }
        assert!(!q.push(entry(99, 0, 0, 99)));
        assert_eq!(q.len(), MAX_ENTITIES);
        let mut last = q.pop().map(|e| e.key);
        while let Some(e) = q.pop() {
            if let Some(prev) = last {
                assert_ne!(e.key.owed_cmp(&prev), Ordering::Greater);
            }
            last = Some(e.key);
            assert_eq!(q.heap_violation(), None);
        }
        assert_eq!(q.len(), 0);
    }
}
