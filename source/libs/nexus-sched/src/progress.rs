// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed-point fairness arithmetic (system progress and unfairness)
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Progress, Unfairness, UNFAIRNESS_SCALE
//! INVARIANTS:
//!   - Progress wraps; only differences between two samples are meaningful
//!   - Unfairness saturates instead of wrapping

use core::cmp::Ordering;
use core::fmt;

/// Unfairness units per nanosecond.
pub const UNFAIRNESS_SCALE: i64 = 256;

/// Accumulated per-entity share of wall-clock time, in unfairness units.
///
/// Advances by `delta_ns * 256 / n` for `n` competing entities. The counter
/// wraps, so compare samples with [`Progress::since`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Progress(u64);

impl Progress {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Advances by `delta_ns` of wall-clock time shared among `sharers` entities.
    /// No entity to share with means no progress.
    #[must_use]
    pub fn advance(self, delta_ns: u64, sharers: usize) -> Self {
        if sharers == 0 {
            return self;
        }
        let step = u128::from(delta_ns) * UNFAIRNESS_SCALE as u128 / sharers as u128;
        Self(self.0.wrapping_add(u64::try_from(step).unwrap_or(u64::MAX)))
    }

    /// Signed distance from `earlier`, valid while the two samples are less
    /// than 2^63 units apart.
    #[inline]
    pub const fn since(self, earlier: Progress) -> i64 {
        self.0.wrapping_sub(earlier.0) as i64
    }
}

/// Compares two wrapping 64-bit keys by their signed distance.
#[inline]
pub(crate) const fn serial_cmp(a: u64, b: u64) -> Ordering {
    let diff = a.wrapping_sub(b) as i64;
    if diff > 0 {
        Ordering::Greater
    } else if diff < 0 {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

/// Signed accumulated owed CPU time in 1/256 ns. Positive means the entity
/// is owed time.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Unfairness(i64);

impl Unfairness {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(i64::MAX);
    pub const MIN: Self = Self(i64::MIN);

    #[inline]
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos.saturating_mul(UNFAIRNESS_SCALE))
    }

    /// Whole nanoseconds, rounded toward zero.
    #[inline]
    pub const fn as_nanos(self) -> i64 {
        self.0 / UNFAIRNESS_SCALE
    }

    /// A waiting entity gains the full progress delta.
    #[inline]
    #[must_use]
    pub const fn credit(self, progress_delta: i64) -> Self {
        Self(self.0.saturating_add(progress_delta))
    }

    /// The running entity pays the delta once for every waiter it kept out.
    #[inline]
    #[must_use]
    pub fn debit(self, waiters: usize, progress_delta: i64) -> Self {
        let waiters = i64::try_from(waiters).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(waiters.saturating_mul(progress_delta)))
    }
}

/// Unfairness frozen at a progress sample. Stays valid while the entity
/// waits, since its credit and system progress grow by the same delta.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct FairnessKey {
    pub base: Unfairness,
    pub reference: Progress,
}

impl FairnessKey {
    pub const ZERO: Self = Self { base: Unfairness::ZERO, reference: Progress::ZERO };

    /// `Greater` when `self` is owed more than `other` at any common progress
    /// point. Widened to `i128` so saturated balances keep their order.
    pub fn owed_cmp(&self, other: &Self) -> Ordering {
        let shift = i128::from(self.reference.since(other.reference));
        i128::from(self.base.0).cmp(&(i128::from(other.base.0) + shift))
    }
}

impl fmt::Display for Unfairness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.as_nanos())
    }
}
