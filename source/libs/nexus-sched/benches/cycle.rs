//! CONTEXT: Scheduling pass latency benchmarks
//! INTENT: Cost of one decision pass and of a block/resume round trip
//! DEPS: criterion (benchmarking), nexus-sched
//! READINESS: Host-only; simulated clock and timer
//! TESTS: Pass with 8 and 64 runnable entities; resume + block cycle
use std::cell::Cell;
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use nexus_sched::{
    Clock, CpuId, Inbox, PreemptionTimer, SchedConfig, ScheduleEntity, Scheduler, WakeSender, MAX_ENTITIES,
};

/// Advances 1ms per read so every pass accounts time.
struct TickingClock(Cell<u64>);

impl Clock for TickingClock {
    fn current_nanos(&self) -> u64 {
        let now = self.0.get() + 1_000_000;
        self.0.set(now);
        now
    }
}

struct NullTimer;

impl PreemptionTimer for NullTimer {
    fn arm_preemption(&mut self, _nanos: u64) {}
    fn disarm_preemption(&mut self) {}
}

struct NullWake;

impl WakeSender for NullWake {
    fn send_wake_interrupt(&self, _cpu: CpuId) {}
}

fn pass_bench(c: &mut Criterion) {
    for runnable in [8, MAX_ENTITIES] {
        c.bench_function(&format!("cycle-{runnable}"), |b| {
            let inbox = Inbox::new(CpuId::BOOT);
            let clock = TickingClock(Cell::new(0));
            let mut sched = Scheduler::new(&inbox, &clock, NullTimer, SchedConfig::DEFAULT);
            for _ in 0..runnable {
                let handle = sched.associate(ScheduleEntity::new()).expect("free slot");
                inbox.resume(handle, &NullWake);
            }
            b.iter(|| black_box(sched.cycle()));
        });
    }
}

fn block_resume_bench(c: &mut Criterion) {
    c.bench_function("block-resume", |b| {
        let inbox = Inbox::new(CpuId::BOOT);
        let clock = TickingClock(Cell::new(0));
        let mut sched = Scheduler::new(&inbox, &clock, NullTimer, SchedConfig::DEFAULT);
        for _ in 0..4 {
            let handle = sched.associate(ScheduleEntity::new()).expect("free slot");
            inbox.resume(handle, &NullWake);
        }
        sched.cycle();
        b.iter(|| {
            let blocked = sched.suspend_current();
            sched.cycle();
            inbox.resume(black_box(blocked), &NullWake);
        });
    });
}

criterion_group!(benches, pass_bench, block_resume_bench);
criterion_main!(benches);
