// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Scheduler error taxonomy
//! OWNERS: @kernel-sched-team
//! PUBLIC API: SchedError, ConfigError, ArenaFull, InvariantError, fatal()
//! INVARIANTS: Every `try_*` operation reports misuse here; plain variants route misuse through `fatal`

use nexus_hal::CpuId;
use thiserror::Error;

use crate::entity::{EntityHandle, ScheduleEntity, ScheduleState};

/// Misuse of the scheduling protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedError {
    #[error("{handle} belongs to {}, not {cpu}", .handle.cpu())]
    WrongScheduler { handle: EntityHandle, cpu: CpuId },
    #[error("{cpu} has no scheduler")]
    InvalidCpu { cpu: CpuId },
    #[error("{handle} no longer names an associated entity")]
    StaleHandle { handle: EntityHandle },
    #[error("{handle} is {actual:?}, expected {expected:?}")]
    InvalidState { handle: EntityHandle, expected: ScheduleState, actual: ScheduleState },
    #[error("{handle} is running")]
    EntityIsCurrent { handle: EntityHandle },
    #[error("{handle} is not the running entity")]
    NotCurrent { handle: EntityHandle },
    #[error("{cpu} has no running entity")]
    NoCurrent { cpu: CpuId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("slice granularity must be non-zero")]
    ZeroGranularity,
    #[error("slice granularity {requested_ns}ns exceeds {max_ns}ns")]
    GranularityTooLarge { requested_ns: u64, max_ns: u64 },
}

/// Every slot of the scheduler is taken; the rejected entity is handed back.
#[derive(Debug, Error)]
#[error("{cpu}: no free entity slot")]
pub struct ArenaFull {
    pub cpu: CpuId,
    pub entity: ScheduleEntity,
}

/// Internal bookkeeping contradiction found by `Scheduler::check_invariants`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvariantError {
    #[error("wait queue violates heap order at index {index}")]
    HeapOrder { index: usize },
    #[error("slot {slot} queued twice")]
    DuplicateEntry { slot: u16 },
    #[error("{handle} is both running and queued")]
    RunningQueued { handle: EntityHandle },
    #[error("{handle} is {actual:?}, expected {expected:?}")]
    StateMismatch { handle: EntityHandle, expected: ScheduleState, actual: ScheduleState },
    #[error("{handle} has no entity record")]
    MissingEntity { handle: EntityHandle },
    #[error("{active} active slots but {accounted} queued or running")]
    ActiveCount { active: usize, accounted: usize },
}

/// Terminates on a protocol violation that the caller chose not to handle.
#[cold]
#[track_caller]
pub fn fatal(err: SchedError) -> ! {
    log::error!(target: "sched", "fatal scheduling error: {err}");
    panic!("sched: {err}")
}
