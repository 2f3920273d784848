// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-CPU fair-share scheduling core
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + tests/ (scenarios, fairness, wake protocol, idle, properties)
//!
//! PUBLIC API:
//!   - Scheduler, Executor, Dispatch: per-CPU decision loop
//!   - Inbox, Topology: cross-CPU resume and wake protocol
//!   - ScheduleEntity, EntityHandle, ScheduleState, Priority
//!   - Progress, Unfairness: fixed-point fairness arithmetic
//!   - SchedConfig, TraceFlags: tunables
//!   - SchedError, ConfigError, ArenaFull, InvariantError
//!
//! DEPENDS_ON:
//!   - nexus_hal (clock, preemption timer, wake interrupt)
//!   - nexus_sync (IRQ-masked spin lock)
//!
//! INVARIANTS:
//!   - One scheduler per CPU; only its inbox is shared
//!   - Priorities dominate; fairness orders equal priorities
//!

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

mod config;
mod entity;
mod error;
mod inbox;
mod progress;
mod scheduler;
mod topology;
mod wait_queue;

pub use config::{SchedConfig, TraceFlags, DEFAULT_SLICE_GRANULARITY_NS, MAX_ENTITIES};
pub use entity::{EntityHandle, Priority, ScheduleEntity, ScheduleState};
pub use error::{fatal, ArenaFull, ConfigError, InvariantError, SchedError};
pub use inbox::{Inbox, ResumeOutcome, WakeEvidence, WakeOutcome};
pub use nexus_hal::{Clock, CpuId, PreemptionTimer, WakeSender, MAX_CPUS};
pub use progress::{Progress, Unfairness, UNFAIRNESS_SCALE};
pub use scheduler::{Dispatch, EntityInfo, Executor, PreemptionState, SchedStats, Scheduler};
pub use topology::Topology;
