//! CONTEXT: Idle dispatch and executor hand-off
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 3 integration tests
//!
//! TEST_SCOPE:
//!   - No runnable entity: one idle suspend per pass, timer disarmed
//!   - Committed entity is handed to the executor
//!
//! TEST_SCENARIOS:
//!   - idle_pass_suspends_once_with_timer_off(): repeated idle passes
//!   - last_blocker_leaves_cpu_idle(): idle after the only runner blocks
//!   - invoke_switches_to_committed_entity(): executor receives the handle
//!
//! DEPENDENCIES:
//!   - tests/common: simulated clock and timer
//!
mod common;

use std::panic::{catch_unwind, AssertUnwindSafe};

use common::{CountingWake, SimClock, G};
use nexus_sched::{CpuId, Dispatch, EntityHandle, Executor, Inbox, PreemptionState, SchedConfig, ScheduleEntity};

/// Records the hand-off, then unwinds in place of a context switch.
#[derive(Default)]
struct RecordingExecutor {
    invoked: Vec<EntityHandle>,
    idles: usize,
}

impl Executor for RecordingExecutor {
    fn invoke(&mut self, entity: EntityHandle) -> ! {
        self.invoked.push(entity);
        panic!("switched to {entity}");
    }

    fn idle_suspend(&mut self) -> ! {
        self.idles += 1;
        panic!("idle");
    }
}

#[test]
fn idle_pass_suspends_once_with_timer_off() {
    let inbox = Inbox::new(CpuId::BOOT);
    let clock = SimClock::new(0);
    let mut sched = common::scheduler(&inbox, &clock, SchedConfig::DEFAULT);
    let mut executor = RecordingExecutor::default();

    for pass in 1..=3 {
        assert_eq!(sched.cycle(), Dispatch::Idle);
        assert_eq!(sched.timer().deadline(), None);
        assert_eq!(sched.preemption(), PreemptionState::Disarmed);
        assert!(catch_unwind(AssertUnwindSafe(|| sched.invoke(&mut executor))).is_err());
        assert_eq!(executor.idles, pass);
        clock.advance(G);
    }
    assert!(executor.invoked.is_empty());
    assert_eq!(sched.system_progress().as_raw(), 0);
}

#[test]
fn last_blocker_leaves_cpu_idle() {
    let inbox = Inbox::new(CpuId::BOOT);
    let clock = SimClock::new(0);
    let wake = CountingWake::default();
    let mut sched = common::scheduler(&inbox, &clock, SchedConfig::DEFAULT);
    let a = sched.associate(ScheduleEntity::new()).unwrap();
    let b = sched.associate(ScheduleEntity::new()).unwrap();
    inbox.resume(a, &wake);
    inbox.resume(b, &wake);

    assert_eq!(sched.cycle(), Dispatch::Run(a));
    assert!(sched.timer().deadline().is_some());
    clock.advance(G / 2);
    sched.suspend_current();
    assert_eq!(sched.cycle(), Dispatch::Run(b));
    assert_eq!(sched.timer().deadline(), None);
    clock.advance(G / 2);
    sched.suspend_current();
    assert_eq!(sched.cycle(), Dispatch::Idle);
    assert_eq!(sched.timer().deadline(), None);
    assert_eq!(sched.stats().current, None);
    assert_eq!(sched.stats().slice_elapsed_ns, 0);
}

#[test]
fn invoke_switches_to_committed_entity() {
    let inbox = Inbox::new(CpuId::BOOT);
    let clock = SimClock::new(0);
    let wake = CountingWake::default();
    let mut sched = common::scheduler(&inbox, &clock, SchedConfig::DEFAULT);
    let a = sched.associate(ScheduleEntity::new()).unwrap();
    inbox.resume(a, &wake);
    sched.cycle();

    let mut executor = RecordingExecutor::default();
    assert!(catch_unwind(AssertUnwindSafe(|| sched.invoke(&mut executor))).is_err());
    assert_eq!(executor.invoked, vec![a]);
    assert_eq!(executor.idles, 0);
}
