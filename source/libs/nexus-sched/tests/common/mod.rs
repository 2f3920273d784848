//! CONTEXT: Simulated hardware collaborators for scheduler integration tests
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Stable
//!
//! TEST_SCOPE:
//!   - Settable clock shared between the test and the scheduler
//!   - Timer that records deadlines against the simulated clock
//!   - Wake sender counting interrupts per CPU
//!
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use nexus_sched::{
    Clock, CpuId, Dispatch, Inbox, PreemptionTimer, SchedConfig, Scheduler, WakeSender, MAX_CPUS,
};

pub const G: u64 = nexus_sched::DEFAULT_SLICE_GRANULARITY_NS;

pub struct SimClock {
    now: AtomicU64,
}

impl SimClock {
    pub fn new(start: u64) -> Self {
        Self { now: AtomicU64::new(start) }
    }

    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    pub fn set(&self, nanos: u64) {
        self.now.store(nanos, Ordering::Release);
    }

    pub fn advance(&self, nanos: u64) {
        self.now.fetch_add(nanos, Ordering::AcqRel);
    }
}

impl Clock for SimClock {
    fn current_nanos(&self) -> u64 {
        self.now()
    }
}

pub struct SimTimer<'c> {
    clock: &'c SimClock,
    deadline: Option<u64>,
    pub arms: usize,
    pub disarms: usize,
    pub last_slice: Option<u64>,
}

impl<'c> SimTimer<'c> {
    pub fn new(clock: &'c SimClock) -> Self {
        Self { clock, deadline: None, arms: 0, disarms: 0, last_slice: None }
    }

    /// Absolute expiry on the simulated clock.
    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }
}

impl PreemptionTimer for SimTimer<'_> {
    fn arm_preemption(&mut self, nanos: u64) {
        self.deadline = Some(self.clock.now().saturating_add(nanos));
        self.arms += 1;
        self.last_slice = Some(nanos);
    }

    fn disarm_preemption(&mut self) {
        self.deadline = None;
        self.disarms += 1;
    }
}

#[derive(Default)]
pub struct CountingWake {
    sent: [AtomicUsize; MAX_CPUS],
}

impl CountingWake {
    pub fn sent(&self, cpu: CpuId) -> usize {
        self.sent[cpu.as_index()].load(Ordering::Acquire)
    }
}

impl WakeSender for CountingWake {
    fn send_wake_interrupt(&self, cpu: CpuId) {
        self.sent[cpu.as_index()].fetch_add(1, Ordering::AcqRel);
    }
}

pub type SimScheduler<'a> = Scheduler<'a, &'a SimClock, SimTimer<'a>>;

pub fn scheduler<'a>(inbox: &'a Inbox, clock: &'a SimClock, config: SchedConfig) -> SimScheduler<'a> {
    Scheduler::new(inbox, clock, SimTimer::new(clock), config)
}

/// Runs scheduling passes at every preemption deadline until `until`,
/// reporting each pass with its timestamp.
pub fn run_until(sched: &mut SimScheduler<'_>, clock: &SimClock, until: u64, mut on_pass: impl FnMut(u64, Dispatch)) {
    loop {
        let dispatch = sched.cycle();
        let now = clock.now();
        on_pass(now, dispatch);
        if now >= until {
            return;
        }
        let next = match sched.timer().deadline() {
            Some(deadline) => deadline.max(now + 1).min(until),
            None => until,
        };
        clock.set(next);
    }
}
