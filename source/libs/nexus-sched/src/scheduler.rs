// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-CPU fair-share scheduler with strict priorities
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/{scenarios,fairness,wake,idle,properties}.rs
//!
//! PUBLIC API:
//!   - Scheduler: associate/unassociate, set_priority, suspend_current,
//!     update/want_reschedule/reschedule/commit, cycle, invoke
//!   - Executor: context-switch collaborator
//!   - Dispatch, PreemptionState, SchedStats, EntityInfo
//!
//! DEPENDS_ON:
//!   - inbox::Inbox (entity states, pending list)
//!   - nexus_hal::{Clock, PreemptionTimer}
//!
//! INVARIANTS:
//!   - Only the owning CPU touches the scheduler; `Scheduler` is !Send and !Sync
//!   - Higher priority always runs before lower priority
//!   - Sum of live unfairness over associated entities is constant while a
//!     runnable entity holds the CPU
//!   - An entity is at most one of: queued, scheduled, running
//!

use core::cmp::Ordering;
use core::marker::PhantomData;

use nexus_hal::{Clock, CpuId, PreemptionTimer};

use crate::config::{SchedConfig, TraceFlags, MAX_ENTITIES};
use crate::entity::{EntityHandle, Priority, ScheduleEntity, ScheduleState};
use crate::error::{fatal, ArenaFull, InvariantError, SchedError};
use crate::inbox::Inbox;
use crate::progress::{Progress, Unfairness, UNFAIRNESS_SCALE};
use crate::wait_queue::{QueueEntry, WaitQueue};

/// Performs the actual switch to an entity or into idle.
pub trait Executor {
    /// Switches to `entity`; control never returns to the caller.
    fn invoke(&mut self, entity: EntityHandle) -> !;
    /// Halts until the next interrupt; control never returns to the caller.
    fn idle_suspend(&mut self) -> !;
}

/// What the CPU should run after a committed scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Run(EntityHandle),
    Idle,
}

/// Last state pushed to the preemption timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptionState {
    Disarmed,
    Armed { nanos: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedStats {
    pub cpu: CpuId,
    pub num_waiting: usize,
    pub current: Option<EntityHandle>,
    pub system_progress: Progress,
    pub preemption: PreemptionState,
    /// Wall-clock nanoseconds since `current` was committed.
    pub slice_elapsed_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityInfo {
    pub handle: EntityHandle,
    pub state: ScheduleState,
    pub priority: Priority,
    pub live_unfairness: Unfairness,
    pub live_runtime_ns: u64,
}

/// Scheduler of one CPU.
///
/// A pass is `update`, then `reschedule` while `want_reschedule`, then
/// `commit`, then `invoke`; [`Scheduler::cycle`] runs the first three.
pub struct Scheduler<'a, C: Clock, T: PreemptionTimer> {
    inbox: &'a Inbox,
    clock: C,
    timer: T,
    config: SchedConfig,
    entities: [Option<ScheduleEntity>; MAX_ENTITIES],
    wait_queue: WaitQueue,
    current: Option<EntityHandle>,
    scheduled: Option<EntityHandle>,
    system_progress: Progress,
    ref_clock: u64,
    slice_clock: u64,
    next_seq: u64,
    dirty: bool,
    preemption: PreemptionState,
    _not_send_sync: PhantomData<*mut ()>,
}

impl<'a, C: Clock, T: PreemptionTimer> Scheduler<'a, C, T> {
    pub fn new(inbox: &'a Inbox, clock: C, timer: T, config: SchedConfig) -> Self {
        let now = clock.current_nanos();
        inbox.set_trace(config.trace());
        log::debug!(
            target: "sched",
            "{}: scheduler up (granularity {}ns, preemption {})",
            inbox.cpu(),
            config.slice_granularity_ns(),
            config.preemption()
        );
        Self {
            inbox,
            clock,
            timer,
            config,
            entities: [const { None }; MAX_ENTITIES],
            wait_queue: WaitQueue::new(),
            current: None,
            scheduled: None,
            system_progress: Progress::ZERO,
            ref_clock: now,
            slice_clock: now,
            next_seq: 0,
            dirty: true,
            preemption: PreemptionState::Disarmed,
            _not_send_sync: PhantomData,
        }
    }

    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.inbox.cpu()
    }

    #[inline]
    pub fn inbox(&self) -> &'a Inbox {
        self.inbox
    }

    #[inline]
    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    #[inline]
    pub fn clock(&self) -> &C {
        &self.clock
    }

    #[inline]
    pub fn timer(&self) -> &T {
        &self.timer
    }

    /// Entity on the CPU since the last `commit`.
    #[inline]
    pub fn current(&self) -> Option<EntityHandle> {
        self.current
    }

    /// Entity picked by `reschedule` but not yet committed.
    #[inline]
    pub fn scheduled(&self) -> Option<EntityHandle> {
        self.scheduled
    }

    #[inline]
    pub fn num_waiting(&self) -> usize {
        self.wait_queue.len()
    }

    #[inline]
    pub fn system_progress(&self) -> Progress {
        self.system_progress
    }

    #[inline]
    pub fn preemption(&self) -> PreemptionState {
        self.preemption
    }

    // -- Entity lifecycle --------------------------------------------------

    /// Takes ownership of `entity` in the `Attached` state.
    pub fn associate(&mut self, entity: ScheduleEntity) -> Result<EntityHandle, ArenaFull> {
        let cpu = self.cpu();
        let Some(index) = self.entities.iter().position(Option::is_none) else {
            log::warn!(target: "sched", "{cpu}: entity arena full");
            return Err(ArenaFull { cpu, entity });
        };
        let slot = index as u16;
        let generation = self.inbox.claim(slot);
        let handle = EntityHandle::new(cpu, slot, generation);
        log::debug!(target: "sched", "{handle}: associated (priority {})", entity.priority);
        self.entities[index] = Some(entity);
        Ok(handle)
    }

    /// Releases an `Attached` entity and hands its record back.
    pub fn try_unassociate(&mut self, handle: EntityHandle) -> Result<ScheduleEntity, SchedError> {
        self.inbox.check(handle)?;
        if self.current == Some(handle) || self.scheduled == Some(handle) {
            return Err(SchedError::EntityIsCurrent { handle });
        }
        self.inbox.transition(handle, ScheduleState::Attached, ScheduleState::Null)?;
        let entity = self.entities[handle.slot_index()].take().ok_or(SchedError::StaleHandle { handle })?;
        log::debug!(target: "sched", "{handle}: unassociated");
        Ok(entity)
    }

    #[track_caller]
    pub fn unassociate(&mut self, handle: EntityHandle) -> ScheduleEntity {
        self.try_unassociate(handle).unwrap_or_else(|err| fatal(err))
    }

    /// Changes the priority of the running entity. Takes effect on the next pass.
    pub fn try_set_priority(&mut self, handle: EntityHandle, priority: Priority) -> Result<(), SchedError> {
        self.inbox.check(handle)?;
        if self.current != Some(handle) {
            return Err(SchedError::NotCurrent { handle });
        }
        self.entity_mut(handle).priority = priority;
        self.dirty = true;
        Ok(())
    }

    #[track_caller]
    pub fn set_priority(&mut self, handle: EntityHandle, priority: Priority) {
        self.try_set_priority(handle, priority).unwrap_or_else(|err| fatal(err))
    }

    /// Takes the running entity off the CPU (it blocked), settling its
    /// fairness and runtime up to now. The caller runs a pass next.
    pub fn try_suspend_current(&mut self) -> Result<EntityHandle, SchedError> {
        let Some(handle) = self.current else {
            return Err(SchedError::NoCurrent { cpu: self.cpu() });
        };
        self.inbox.transition(handle, ScheduleState::Active, ScheduleState::Attached)?;
        let now = self.clock.current_nanos();
        self.sync_progress(now);
        self.commit_accounting(handle);
        self.current = None;
        self.dirty = true;
        if self.config.traces(TraceFlags::LIFECYCLE) {
            log::trace!(target: "sched", "{handle}: suspended");
        }
        Ok(handle)
    }

    #[track_caller]
    pub fn suspend_current(&mut self) -> EntityHandle {
        self.try_suspend_current().unwrap_or_else(|err| fatal(err))
    }

    // -- Scheduling pass ---------------------------------------------------

    /// Advances system progress to now, charges the running entity and
    /// merges newly resumed entities into the wait queue.
    pub fn update(&mut self) {
        let now = self.clock.current_nanos();
        self.sync_progress(now);
        self.drain_pending();
    }

    /// Whether the best waiter should displace the running (or scheduled) entity.
    pub fn want_reschedule(&self) -> bool {
        let Some(top) = self.wait_queue.peek() else {
            return false;
        };
        let Some(incumbent) = self.incumbent() else {
            return true;
        };
        match ScheduleEntity::order_priority(self.entity(incumbent), self.entity(top.handle)) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.preemption_margin(incumbent, top.handle) < 0,
        }
    }

    /// Returns the running and scheduled entities to the wait queue and picks
    /// the best waiter as the new scheduled entity.
    pub fn reschedule(&mut self) {
        if let Some(handle) = self.current {
            self.unschedule(handle);
            self.current = None;
        }
        if let Some(handle) = self.scheduled {
            self.unschedule(handle);
            self.scheduled = None;
        }
        self.schedule();
        self.dirty = true;
    }

    /// Installs the scheduled entity and reprograms the preemption timer if
    /// anything changed since the last commit.
    pub fn commit(&mut self) {
        if self.current.is_none() {
            if let Some(handle) = self.scheduled.take() {
                self.current = Some(handle);
                self.slice_clock = self.ref_clock;
                self.dirty = true;
            }
        }
        if self.dirty {
            self.update_preemption();
            self.dirty = false;
        }
    }

    pub fn dispatch(&self) -> Dispatch {
        match self.current {
            Some(handle) => Dispatch::Run(handle),
            None => Dispatch::Idle,
        }
    }

    /// One full pass: update, reschedule to a fixed point, commit.
    pub fn cycle(&mut self) -> Dispatch {
        self.update();
        while self.want_reschedule() {
            self.reschedule();
        }
        self.commit();
        self.dispatch()
    }

    /// Hands the CPU to the committed entity, or idles.
    pub fn invoke<E: Executor>(&self, executor: &mut E) -> ! {
        match self.dispatch() {
            Dispatch::Run(handle) => executor.invoke(handle),
            Dispatch::Idle => {
                if self.config.traces(TraceFlags::LIFECYCLE) {
                    log::trace!(target: "sched", "{}: idle", self.cpu());
                }
                executor.idle_suspend()
            }
        }
    }

    // -- Diagnostics -------------------------------------------------------

    /// Unfairness folded forward to the last update. `None` unless `Active`.
    pub fn live_unfairness(&self, handle: EntityHandle) -> Option<Unfairness> {
        (self.inbox.state(handle)? == ScheduleState::Active).then(|| self.live_unfairness_of(handle))
    }

    /// Runtime including the unsettled part of the current slice.
    pub fn live_runtime(&self, handle: EntityHandle) -> Option<u64> {
        self.inbox.state(handle)?;
        Some(self.live_runtime_of(handle))
    }

    pub fn entity_info(&self, handle: EntityHandle) -> Option<EntityInfo> {
        let state = self.inbox.state(handle)?;
        let entity = self.entities[handle.slot_index()].as_ref()?;
        let live_unfairness = match state {
            ScheduleState::Active => self.live_unfairness_of(handle),
            _ => entity.base_unfairness,
        };
        Some(EntityInfo {
            handle,
            state,
            priority: entity.priority,
            live_unfairness,
            live_runtime_ns: self.live_runtime_of(handle),
        })
    }

    pub fn stats(&self) -> SchedStats {
        SchedStats {
            cpu: self.cpu(),
            num_waiting: self.num_waiting(),
            current: self.current,
            system_progress: self.system_progress,
            preemption: self.preemption,
            slice_elapsed_ns: match self.current {
                Some(_) => self.ref_clock.saturating_sub(self.slice_clock),
                None => 0,
            },
        }
    }

    /// Cross-checks the wait queue, the running entity and the slot states.
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        if let Some(index) = self.wait_queue.heap_violation() {
            return Err(InvariantError::HeapOrder { index });
        }
        let mut queued = [false; MAX_ENTITIES];
        for entry in self.wait_queue.as_slice() {
            let handle = entry.handle;
            if core::mem::replace(&mut queued[handle.slot_index()], true) {
                return Err(InvariantError::DuplicateEntry { slot: handle.slot() });
            }
            if self.current == Some(handle) || self.scheduled == Some(handle) {
                return Err(InvariantError::RunningQueued { handle });
            }
            self.expect_active(handle)?;
        }
        for handle in [self.current, self.scheduled].into_iter().flatten() {
            self.expect_active(handle)?;
        }
        let active = (0..MAX_ENTITIES as u16)
            .filter(|&slot| {
                self.entities[usize::from(slot)].is_some()
                    && self.inbox.state(self.handle_at(slot)) == Some(ScheduleState::Active)
            })
            .count();
        let accounted =
            self.wait_queue.len() + usize::from(self.current.is_some()) + usize::from(self.scheduled.is_some());
        if active != accounted {
            return Err(InvariantError::ActiveCount { active, accounted });
        }
        Ok(())
    }

    // -- Internals ---------------------------------------------------------

    fn incumbent(&self) -> Option<EntityHandle> {
        self.current.or(self.scheduled)
    }

    fn entity(&self, handle: EntityHandle) -> &ScheduleEntity {
        match self.entities[handle.slot_index()].as_ref() {
            Some(entity) => entity,
            None => fatal(SchedError::StaleHandle { handle }),
        }
    }

    fn entity_mut(&mut self, handle: EntityHandle) -> &mut ScheduleEntity {
        match self.entities[handle.slot_index()].as_mut() {
            Some(entity) => entity,
            None => fatal(SchedError::StaleHandle { handle }),
        }
    }

    fn handle_at(&self, slot: u16) -> EntityHandle {
        EntityHandle::new(self.cpu(), slot, self.inbox.generation(slot))
    }

    fn expect_active(&self, handle: EntityHandle) -> Result<(), InvariantError> {
        if self.entities[handle.slot_index()].is_none() {
            return Err(InvariantError::MissingEntity { handle });
        }
        match self.inbox.state(handle) {
            Some(ScheduleState::Active) => Ok(()),
            actual => Err(InvariantError::StateMismatch {
                handle,
                expected: ScheduleState::Active,
                actual: actual.unwrap_or(ScheduleState::Null),
            }),
        }
    }

    fn live_unfairness_of(&self, handle: EntityHandle) -> Unfairness {
        let running_against = (self.incumbent() == Some(handle)).then(|| self.num_waiting());
        self.entity(handle).live_unfairness(self.system_progress, running_against)
    }

    fn live_runtime_of(&self, handle: EntityHandle) -> u64 {
        let entity = self.entity(handle);
        if self.incumbent() == Some(handle) {
            entity.run_time.saturating_add(self.ref_clock.saturating_sub(entity.ref_clock))
        } else {
            entity.run_time
        }
    }

    /// `live(incumbent) + G - live(top)`; negative means `top` is owed more
    /// than the incumbent by over one slice granularity.
    fn preemption_margin(&self, incumbent: EntityHandle, top: EntityHandle) -> i64 {
        self.live_unfairness_of(incumbent)
            .as_raw()
            .saturating_add(self.config.granularity_units())
            .saturating_sub(self.live_unfairness_of(top).as_raw())
    }

    fn sync_progress(&mut self, now: u64) {
        let delta = now.saturating_sub(self.ref_clock);
        self.ref_clock = self.ref_clock.max(now);
        if delta == 0 {
            return;
        }
        self.dirty = true;
        let sharers = self.num_waiting() + usize::from(self.current.is_some());
        self.system_progress = self.system_progress.advance(delta, sharers);
        if let Some(handle) = self.current {
            self.commit_accounting(handle);
        }
    }

    /// Folds live unfairness (and, for the incumbent, elapsed runtime) into
    /// the entity's base values. Only called at accounting points: the
    /// periodic update, unschedule, schedule and suspend.
    fn commit_accounting(&mut self, handle: EntityHandle) {
        let running = self.incumbent() == Some(handle);
        let unfairness = self.live_unfairness_of(handle);
        let progress = self.system_progress;
        let now = self.ref_clock;
        let entity = self.entity_mut(handle);
        entity.base_unfairness = unfairness;
        entity.ref_progress = progress;
        if running {
            entity.run_time = entity.run_time.saturating_add(now.saturating_sub(entity.ref_clock));
        }
        entity.ref_clock = now;
        if self.config.traces(TraceFlags::UPDATES) {
            log::trace!(
                target: "sched",
                "{handle}: unfairness {unfairness} ({})",
                if running { "running" } else { "waiting" }
            );
        }
    }

    fn drain_pending(&mut self) {
        let batch = self.inbox.take_pending();
        for &handle in batch.as_slice() {
            if let Err(err) = self.inbox.transition(handle, ScheduleState::Pending, ScheduleState::Active) {
                fatal(err);
            }
            let progress = self.system_progress;
            let now = self.ref_clock;
            let entity = self.entity_mut(handle);
            entity.ref_progress = progress;
            entity.ref_clock = now;
            self.enqueue(handle);
            self.dirty = true;
            if self.config.traces(TraceFlags::LIFECYCLE) {
                log::trace!(target: "sched::wake", "{handle}: runnable");
            }
        }
    }

    fn enqueue(&mut self, handle: EntityHandle) {
        let entity = self.entity(handle);
        let entry = QueueEntry {
            handle,
            priority: entity.priority,
            key: entity.fairness_key(),
            seq: self.next_seq,
        };
        self.next_seq = self.next_seq.wrapping_add(1);
        let queued = self.wait_queue.push(entry);
        assert!(queued, "sched: wait queue overflow");
    }

    /// Requires `handle` to still be the incumbent.
    fn unschedule(&mut self, handle: EntityHandle) {
        self.commit_accounting(handle);
        self.enqueue(handle);
    }

    fn schedule(&mut self) {
        let Some(entry) = self.wait_queue.pop() else {
            return;
        };
        let handle = entry.handle;
        self.commit_accounting(handle);
        self.scheduled = Some(handle);
        if self.config.traces(TraceFlags::SCHEDULING) {
            log::trace!(
                target: "sched",
                "{handle}: scheduled (priority {}, unfairness {})",
                entry.priority,
                self.entity(handle).base_unfairness
            );
        }
        if self.config.traces(TraceFlags::NEXT_BEST) {
            if let Some(next) = self.wait_queue.peek() {
                log::trace!(
                    target: "sched",
                    "{}: next best (priority {}, unfairness {})",
                    next.handle,
                    next.priority,
                    self.live_unfairness_of(next.handle)
                );
            }
        }
    }

    fn preemption_decision(&self) -> PreemptionState {
        if !self.config.preemption() {
            return PreemptionState::Disarmed;
        }
        let Some(top) = self.wait_queue.peek() else {
            return PreemptionState::Disarmed;
        };
        let Some(current) = self.current else {
            return PreemptionState::Armed { nanos: 0 };
        };
        match ScheduleEntity::order_priority(self.entity(current), self.entity(top.handle)) {
            Ordering::Less => PreemptionState::Disarmed,
            Ordering::Greater => PreemptionState::Armed { nanos: 0 },
            Ordering::Equal => {
                let margin = self.preemption_margin(current, top.handle);
                let nanos = if margin < 0 { 0 } else { (margin / UNFAIRNESS_SCALE) as u64 + 1 };
                PreemptionState::Armed { nanos }
            }
        }
    }

    fn update_preemption(&mut self) {
        let decision = self.preemption_decision();
        match decision {
            PreemptionState::Disarmed => self.timer.disarm_preemption(),
            PreemptionState::Armed { nanos } => {
                if self.config.traces(TraceFlags::TIME_SLICE) {
                    log::trace!(target: "sched", "{}: slice {nanos}ns", self.cpu());
                }
                self.timer.arm_preemption(nanos);
            }
        }
        self.preemption = decision;
    }
}

static_assertions::assert_not_impl_any!(
    Scheduler<'static, &'static dyn Clock, &'static mut dyn PreemptionTimer>: Send, Sync
);
