// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Scheduler tunables and fixed capacities
//! OWNERS: @kernel-sched-team
//! PUBLIC API: SchedConfig, TraceFlags, MAX_ENTITIES, DEFAULT_SLICE_GRANULARITY_NS
//! DEPENDS_ON: progress::UNFAIRNESS_SCALE
//! INVARIANTS: granularity non-zero and representable in unfairness units; no global mutable knobs

use bitflags::bitflags;

use crate::error::ConfigError;
use crate::progress::UNFAIRNESS_SCALE;

/// Entity slots per scheduler. Wait queue and pending list share this bound.
pub const MAX_ENTITIES: usize = 64;

/// Minimum fairness budget a running entity gets before a same-priority peer
/// may preempt it.
pub const DEFAULT_SLICE_GRANULARITY_NS: u64 = 10_000_000;

const MAX_SLICE_GRANULARITY_NS: u64 = (i64::MAX / UNFAIRNESS_SCALE) as u64;

bitflags! {
    /// Decision points that emit `log::trace!` output.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TraceFlags: u8 {
        /// Every entity picked to run.
        const SCHEDULING = 1 << 0;
        /// The runner-up left in the queue after a pick.
        const NEXT_BEST = 1 << 1;
        /// Unfairness debits/credits at accounting points.
        const UPDATES = 1 << 2;
        /// Every armed preemption slice.
        const TIME_SLICE = 1 << 3;
        /// Entities becoming runnable, suspending, and the CPU idling.
        const LIFECYCLE = 1 << 4;
        /// Wake interrupts sent by resumes, on any CPU.
        const WAKE = 1 << 5;
    }
}

/// Per-scheduler configuration, validated on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedConfig {
    slice_granularity_ns: u64,
    preemption: bool,
    trace: TraceFlags,
}

impl SchedConfig {
    pub const DEFAULT: Self = Self {
        slice_granularity_ns: DEFAULT_SLICE_GRANULARITY_NS,
        preemption: true,
        trace: TraceFlags::empty(),
    };

    pub fn new(slice_granularity_ns: u64) -> Result<Self, ConfigError> {
        if slice_granularity_ns == 0 {
            return Err(ConfigError::ZeroGranularity);
        }
        if slice_granularity_ns > MAX_SLICE_GRANULARITY_NS {
            return Err(ConfigError::GranularityTooLarge {
                requested_ns: slice_granularity_ns,
                max_ns: MAX_SLICE_GRANULARITY_NS,
            });
        }
        Ok(Self { slice_granularity_ns, ..Self::DEFAULT })
    }

    /// Disabling preemption leaves the timer disarmed; entities then only
    /// switch at blocking points and explicit reschedules.
    pub const fn with_preemption(mut self, enabled: bool) -> Self {
        self.preemption = enabled;
        self
    }

    pub const fn with_trace(mut self, trace: TraceFlags) -> Self {
        self.trace = trace;
        self
    }

    #[inline]
    pub const fn slice_granularity_ns(&self) -> u64 {
        self.slice_granularity_ns
    }

    #[inline]
    pub const fn preemption(&self) -> bool {
        self.preemption
    }

    #[inline]
    pub const fn trace(&self) -> TraceFlags {
        self.trace
    }

    #[inline]
    pub(crate) fn traces(&self, flag: TraceFlags) -> bool {
        self.trace.contains(flag)
    }

    /// Granularity in unfairness units (1/256 ns).
    #[inline]
    pub(crate) const fn granularity_units(&self) -> i64 {
        self.slice_granularity_ns as i64 * UNFAIRNESS_SCALE
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
