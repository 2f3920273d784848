// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-CPU inbox table (routes resumes to the owning CPU)
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Topology
//! DEPENDS_ON: inbox::Inbox
//! INVARIANTS: `inbox(cpu).cpu() == cpu` for every valid CPU

use nexus_hal::{CpuId, WakeSender, MAX_CPUS};
use static_assertions::const_assert_eq;

use crate::entity::EntityHandle;
use crate::error::{fatal, SchedError};
use crate::inbox::{Inbox, ResumeOutcome, WakeOutcome};

const_assert_eq!(MAX_CPUS, 4);

/// One inbox per CPU, indexed by [`CpuId`]. Usually a `static`; each CPU
/// builds its `Scheduler` on `inbox(cpu)` during bring-up.
pub struct Topology {
    inboxes: [Inbox; MAX_CPUS],
}

impl Topology {
    pub const fn new() -> Self {
        Self {
            inboxes: [
                Inbox::new(CpuId::from_raw(0)),
                Inbox::new(CpuId::from_raw(1)),
                Inbox::new(CpuId::from_raw(2)),
                Inbox::new(CpuId::from_raw(3)),
            ],
        }
    }

    #[inline]
    pub fn inbox(&self, cpu: CpuId) -> Option<&Inbox> {
        self.inboxes.get(cpu.as_index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Inbox> {
        self.inboxes.iter()
    }

    /// Resumes `handle` on whichever CPU owns it.
    pub fn try_resume<W: WakeSender>(&self, handle: EntityHandle, wake: &W) -> Result<ResumeOutcome, SchedError> {
        let cpu = handle.cpu();
        self.inbox(cpu).ok_or(SchedError::InvalidCpu { cpu })?.try_resume(handle, wake)
    }

    #[track_caller]
    pub fn resume<W: WakeSender>(&self, handle: EntityHandle, wake: &W) -> ResumeOutcome {
        self.try_resume(handle, wake).unwrap_or_else(|err| fatal(err))
    }

    /// Wake-interrupt entry for `cpu`.
    pub fn handle_wake(&self, cpu: CpuId) -> Result<WakeOutcome, SchedError> {
        self.inbox(cpu).map(Inbox::handle_wake).ok_or(SchedError::InvalidCpu { cpu })
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}
