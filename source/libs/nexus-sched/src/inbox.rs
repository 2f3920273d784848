// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cross-CPU face of a scheduler (entity state words, pending list, wake evidence)
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/wake.rs (multi-threaded resume stress)
//! PUBLIC API: Inbox, ResumeOutcome, WakeOutcome, WakeEvidence
//! DEPENDS_ON: nexus_sync::IrqSpinLock, nexus_hal::WakeSender
//! INVARIANTS:
//!   - Entity state changes only by compare-and-swap on its slot word
//!   - A wake interrupt is sent only when the pending list goes from empty to non-empty
//!   - The wake interrupt is sent after the pending lock is released

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use nexus_hal::{CpuId, WakeSender};
use nexus_sync::IrqSpinLock;

use crate::config::{TraceFlags, MAX_ENTITIES};
use crate::entity::{EntityHandle, ScheduleState};
use crate::error::{fatal, SchedError};

const STATE_MASK: u64 = 0xff;
const GENERATION_SHIFT: u32 = 32;

#[inline]
const fn pack(generation: u32, state: ScheduleState) -> u64 {
    ((generation as u64) << GENERATION_SHIFT) | state as u64
}

#[inline]
const fn unpack(word: u64) -> (u32, ScheduleState) {
    ((word >> GENERATION_SHIFT) as u32, ScheduleState::from_bits((word & STATE_MASK) as u8))
}

/// Result of resuming an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The pending list was empty; the owning CPU was interrupted.
    WakeSent,
    /// A wake for the current batch is already on its way.
    Coalesced,
}

/// Result of acknowledging a wake interrupt on the owning CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum WakeOutcome {
    Acked,
    NoPendingRequest,
}

/// Counters proving every resume reached the owning scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WakeEvidence {
    pub resumes: usize,
    pub wakes_sent: usize,
    pub wakes_handled: usize,
    pub batches_taken: usize,
}

/// Resumed entities not yet merged into the wait queue.
#[derive(Clone, Copy)]
pub(crate) struct PendingList {
    handles: [EntityHandle; MAX_ENTITIES],
    len: usize,
}

impl PendingList {
    const EMPTY: Self = Self { handles: [EntityHandle::new(CpuId::BOOT, 0, 0); MAX_ENTITIES], len: 0 };

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[EntityHandle] {
        &self.handles[..self.len]
    }

    fn push(&mut self, handle: EntityHandle) -> bool {
        match self.handles.get_mut(self.len) {
            Some(place) => {
                *place = handle;
                self.len += 1;
                true
            }
            None => false,
        }
    }
}

/// State shared between a CPU's scheduler and every other CPU.
///
/// Remote CPUs only ever resume entities and read evidence; everything else
/// goes through the owning [`Scheduler`](crate::Scheduler).
pub struct Inbox {
    cpu: CpuId,
    slots: [AtomicU64; MAX_ENTITIES],
    pending: IrqSpinLock<PendingList>,
    wake_requested: AtomicBool,
    trace: AtomicU8,
    resumes: AtomicUsize,
    wakes_sent: AtomicUsize,
    wakes_handled: AtomicUsize,
    batches_taken: AtomicUsize,
}

impl Inbox {
    pub const fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            slots: [const { AtomicU64::new(0) }; MAX_ENTITIES],
            pending: IrqSpinLock::new(PendingList::EMPTY),
            wake_requested: AtomicBool::new(false),
            trace: AtomicU8::new(0),
            resumes: AtomicUsize::new(0),
            wakes_sent: AtomicUsize::new(0),
            wakes_handled: AtomicUsize::new(0),
            batches_taken: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub const fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Current lifecycle state, or `None` if the handle is stale or foreign.
    pub fn state(&self, handle: EntityHandle) -> Option<ScheduleState> {
        if handle.cpu() != self.cpu {
            return None;
        }
        let (generation, state) = unpack(self.slots.get(handle.slot_index())?.load(Ordering::Acquire));
        (generation == handle.generation() && state != ScheduleState::Null).then_some(state)
    }

    /// Marks an attached entity runnable and hands it to the owning CPU.
    ///
    /// Callable from any CPU, including the owner (a self-wake still goes
    /// through the wake sender).
    pub fn try_resume<W: WakeSender>(&self, handle: EntityHandle, wake: &W) -> Result<ResumeOutcome, SchedError> {
        self.check(handle)?;
        let first = {
            let mut pending = self.pending.lock();
            self.transition(handle, ScheduleState::Attached, ScheduleState::Pending)?;
            let first = pending.is_empty();
            if !pending.push(handle) {
                // Unreachable while the list and the slot table share one bound.
                let _ = self.transition(handle, ScheduleState::Pending, ScheduleState::Attached);
                return Err(SchedError::InvalidState {
                    handle,
                    expected: ScheduleState::Attached,
                    actual: ScheduleState::Pending,
                });
            }
            first
        };
        self.resumes.fetch_add(1, Ordering::Relaxed);
        if !first {
            return Ok(ResumeOutcome::Coalesced);
        }
        self.wake_requested.store(true, Ordering::Release);
        self.wakes_sent.fetch_add(1, Ordering::Relaxed);
        if self.traces(TraceFlags::WAKE) {
            log::trace!(target: "sched::wake", "{handle}: wake {}", self.cpu);
        }
        wake.send_wake_interrupt(self.cpu);
        Ok(ResumeOutcome::WakeSent)
    }

    #[track_caller]
    pub fn resume<W: WakeSender>(&self, handle: EntityHandle, wake: &W) -> ResumeOutcome {
        self.try_resume(handle, wake).unwrap_or_else(|err| fatal(err))
    }

    /// Acknowledges a wake interrupt on the owning CPU. The caller follows up
    /// with a scheduling pass, which drains the pending list.
    pub fn handle_wake(&self) -> WakeOutcome {
        if self.wake_requested.swap(false, Ordering::AcqRel) {
            self.wakes_handled.fetch_add(1, Ordering::Relaxed);
            WakeOutcome::Acked
        } else {
            WakeOutcome::NoPendingRequest
        }
    }

    pub fn evidence(&self) -> WakeEvidence {
        WakeEvidence {
            resumes: self.resumes.load(Ordering::Acquire),
            wakes_sent: self.wakes_sent.load(Ordering::Acquire),
            wakes_handled: self.wakes_handled.load(Ordering::Acquire),
            batches_taken: self.batches_taken.load(Ordering::Acquire),
        }
    }

    /// Trace switches for resumes, which run on remote CPUs without the
    /// owner's config at hand.
    pub(crate) fn set_trace(&self, trace: TraceFlags) {
        self.trace.store(trace.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn traces(&self, flag: TraceFlags) -> bool {
        TraceFlags::from_bits_truncate(self.trace.load(Ordering::Relaxed)).contains(flag)
    }

    /// Swaps the pending list for an empty one.
    pub(crate) fn take_pending(&self) -> PendingList {
        let batch = core::mem::replace(&mut *self.pending.lock(), PendingList::EMPTY);
        if !batch.is_empty() {
            self.batches_taken.fetch_add(1, Ordering::Relaxed);
        }
        batch
    }

    /// Binds a free slot to a new generation in the `Attached` state.
    /// Owner-only: remote CPUs never touch `Null` slots.
    pub(crate) fn claim(&self, slot: u16) -> u32 {
        let word = &self.slots[usize::from(slot)];
        let (generation, _) = unpack(word.load(Ordering::Acquire));
        let generation = generation.wrapping_add(1);
        word.store(pack(generation, ScheduleState::Attached), Ordering::Release);
        generation
    }

    pub(crate) fn generation(&self, slot: u16) -> u32 {
        unpack(self.slots[usize::from(slot)].load(Ordering::Acquire)).0
    }

    pub(crate) fn check(&self, handle: EntityHandle) -> Result<(), SchedError> {
        if handle.cpu() != self.cpu {
            return Err(SchedError::WrongScheduler { handle, cpu: self.cpu });
        }
        if handle.slot_index() >= MAX_ENTITIES {
            return Err(SchedError::StaleHandle { handle });
        }
        Ok(())
    }

    /// Moves `handle` from `from` to `to`, failing if another transition got there first.
    pub(crate) fn transition(&self, handle: EntityHandle, from: ScheduleState, to: ScheduleState) -> Result<(), SchedError> {
        self.check(handle)?;
        let generation = handle.generation();
        self.slots[handle.slot_index()]
            .compare_exchange(pack(generation, from), pack(generation, to), Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(|word| match unpack(word) {
                (current, state) if current != generation || state == ScheduleState::Null => {
                    SchedError::StaleHandle { handle }
                }
                (_, actual) => SchedError::InvalidState { handle, expected: from, actual },
            })
    }
}
