// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware collaborators consumed by the per-CPU scheduler
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/collaborators.rs
//! PUBLIC API: CpuId, MAX_CPUS, Clock, PreemptionTimer, WakeSender
//! INVARIANTS: Clock is monotonic; timer is one-shot (re-arming replaces the previous countdown)

#![cfg_attr(not(test), no_std)]

use core::fmt;

/// Fixed CPU ceiling for bounded per-CPU state.
pub const MAX_CPUS: usize = 4;

/// Logical CPU identifier used to index per-CPU state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CpuId(u16);

impl CpuId {
    /// The CPU that brings the system up.
    pub const BOOT: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    /// Returns the CPU as an index into per-CPU tables.
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_boot(self) -> bool {
        self.0 == Self::BOOT.0
    }

    /// Returns `true` if the id addresses a slot of a `MAX_CPUS` table.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.as_index() < MAX_CPUS
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Monotonic nanosecond time source.
pub trait Clock {
    fn current_nanos(&self) -> u64;
}

/// One-shot countdown that interrupts the owning CPU when it expires.
pub trait PreemptionTimer {
    /// Arms the countdown to fire `nanos` from now, replacing any earlier deadline.
    fn arm_preemption(&mut self, nanos: u64);
    fn disarm_preemption(&mut self);
}

/// Lightweight inter-processor interrupt that only prompts a scheduling pass.
///
/// Called from any CPU, possibly with interrupts masked, so implementations
/// must not block.
pub trait WakeSender {
    fn send_wake_interrupt(&self, cpu: CpuId);
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn current_nanos(&self) -> u64 {
        (**self).current_nanos()
    }
}

impl<T: PreemptionTimer + ?Sized> PreemptionTimer for &mut T {
    #[inline]
    fn arm_preemption(&mut self, nanos: u64) {
        (**self).arm_preemption(nanos)
    }

    #[inline]
    fn disarm_preemption(&mut self) {
        (**self).disarm_preemption()
    }
}

impl<W: WakeSender + ?Sized> WakeSender for &W {
    #[inline]
    fn send_wake_interrupt(&self, cpu: CpuId) {
        (**self).send_wake_interrupt(cpu)
    }
}
