// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Schedulable entity record, lifecycle states and handles
//! OWNERS: @kernel-sched-team
//! PUBLIC API: ScheduleEntity, ScheduleState, EntityHandle, Priority
//! DEPENDS_ON: progress::{Progress, Unfairness}
//! INVARIANTS:
//!   - Higher priority strictly dominates; fairness only orders equal priorities
//!   - A handle names one association; the slot generation retires it

use core::cmp::Ordering;
use core::fmt;

use nexus_hal::CpuId;

use crate::progress::{FairnessKey, Progress, Unfairness};

/// Strict scheduling priority; larger runs first.
pub type Priority = i32;

/// Lifecycle of an entity with respect to its scheduler.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleState {
    /// Slot not associated with any entity.
    Null = 0,
    /// Associated but not runnable.
    Attached = 1,
    /// Resumed; waiting in the scheduler's pending list.
    Pending = 2,
    /// Runnable: queued, scheduled or running.
    Active = 3,
}

impl ScheduleState {
    #[inline]
    pub(crate) const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::Attached,
            2 => Self::Pending,
            3 => Self::Active,
            _ => Self::Null,
        }
    }
}

/// Scheduling record of one thread-like entity.
///
/// Owned by the scheduler between `associate` and `unassociate`; callers hold
/// an [`EntityHandle`] meanwhile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntity {
    pub(crate) priority: Priority,
    pub(crate) base_unfairness: Unfairness,
    pub(crate) ref_progress: Progress,
    pub(crate) ref_clock: u64,
    pub(crate) run_time: u64,
}

impl ScheduleEntity {
    pub const fn new() -> Self {
        Self {
            priority: 0,
            base_unfairness: Unfairness::ZERO,
            ref_progress: Progress::ZERO,
            ref_clock: 0,
            run_time: 0,
        }
    }

    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Starts the entity with a carried-over fairness balance.
    pub const fn with_unfairness(mut self, unfairness: Unfairness) -> Self {
        self.base_unfairness = unfairness;
        self
    }

    #[inline]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Unfairness as of the entity's last accounting point.
    #[inline]
    pub const fn base_unfairness(&self) -> Unfairness {
        self.base_unfairness
    }

    /// Nanoseconds spent running, up to the last accounting point.
    #[inline]
    pub const fn run_time(&self) -> u64 {
        self.run_time
    }

    /// `Greater` if `b` should be preferred over `a` on priority alone.
    #[inline]
    pub fn order_priority(a: &Self, b: &Self) -> Ordering {
        b.priority.cmp(&a.priority)
    }

    /// Whether waiting `a` is owed more than waiting `b`. The wait queue
    /// orders equal priorities by the same comparison.
    #[inline]
    pub fn schedule_before(a: &Self, b: &Self) -> bool {
        a.fairness_key().owed_cmp(&b.fairness_key()) == Ordering::Greater
    }

    #[inline]
    pub(crate) const fn fairness_key(&self) -> FairnessKey {
        FairnessKey { base: self.base_unfairness, reference: self.ref_progress }
    }

    /// Fairness folded forward to `system`: credited while waiting, debited
    /// once per waiter while running.
    pub(crate) fn live_unfairness(&self, system: Progress, running_against: Option<usize>) -> Unfairness {
        let delta = system.since(self.ref_progress);
        match running_against {
            Some(waiters) => self.base_unfairness.debit(waiters, delta),
            None => self.base_unfairness.credit(delta),
        }
    }
}

impl Default for ScheduleEntity {
    fn default() -> Self {
        Self::new()
    }
}

/// Names one association of an entity with the scheduler of `cpu`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntityHandle {
    cpu: CpuId,
    slot: u16,
    generation: u32,
}

impl EntityHandle {
    #[inline]
    pub(crate) const fn new(cpu: CpuId, slot: u16, generation: u32) -> Self {
        Self { cpu, slot, generation }
    }

    /// CPU whose scheduler owns the entity.
    #[inline]
    pub const fn cpu(self) -> CpuId {
        self.cpu
    }

    #[inline]
    pub const fn slot(self) -> u16 {
        self.slot
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    #[inline]
    pub(crate) const fn slot_index(self) -> usize {
        self.slot as usize
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:slot{}#{}", self.cpu, self.slot, self.generation)
    }
}
