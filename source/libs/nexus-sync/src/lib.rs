// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Interrupt-masked spin lock for short cross-CPU critical sections
//! OWNERS: @kernel-sync-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (mask nesting, contention)
//! PUBLIC API: IrqSpinLock, IrqSpinLockGuard, InterruptMask, NoopMask, PlatformMask
//! DEPENDS_ON: spin::Mutex, riscv sstatus CSR (OS)
//! INVARIANTS: Interrupts stay masked for the whole guard lifetime; lock released before the mask is restored

#![cfg_attr(not(test), no_std)]

use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

/// Local interrupt masking used around spin-lock critical sections.
///
/// `save_and_disable` must nest: the returned state restores exactly the
/// masking that was in effect before the call.
pub trait InterruptMask {
    type State: Copy;

    fn save_and_disable() -> Self::State;
    fn restore(state: Self::State);
}

/// Mask for hosted builds, where there is no interrupt to mask.
pub struct NoopMask;

impl InterruptMask for NoopMask {
    type State = ();

    #[inline]
    fn save_and_disable() {}

    #[inline]
    fn restore(_state: ()) {}
}

/// Supervisor interrupt enable (`sstatus.SIE`) mask.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub struct SstatusMask;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
impl InterruptMask for SstatusMask {
    type State = bool;

    #[inline]
    fn save_and_disable() -> bool {
        let enabled = riscv::register::sstatus::read().sie();
        // SAFETY: clearing SIE only masks supervisor interrupts on this hart.
        unsafe { riscv::register::sstatus::clear_sie() };
        enabled
    }

    #[inline]
    fn restore(enabled: bool) {
        if enabled {
            // SAFETY: re-enables exactly what `save_and_disable` observed.
            unsafe { riscv::register::sstatus::set_sie() };
        }
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub type PlatformMask = SstatusMask;

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub type PlatformMask = NoopMask;

/// A spin lock that masks local interrupts while held.
///
/// Only meant for bounded critical sections (a handful of stores); a holder
/// must never block or take another `IrqSpinLock` in a different order.
pub struct IrqSpinLock<T: ?Sized, M: InterruptMask = PlatformMask> {
    _mask: PhantomData<fn() -> M>,
    inner: spin::Mutex<T>,
}

impl<T, M: InterruptMask> IrqSpinLock<T, M> {
    pub const fn new(value: T) -> Self {
        Self { _mask: PhantomData, inner: spin::Mutex::new(value) }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized, M: InterruptMask> IrqSpinLock<T, M> {
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T, M> {
        let state = M::save_and_disable();
        let guard = self.inner.lock();
        IrqSpinLockGuard { guard: ManuallyDrop::new(guard), state }
    }

    /// Attempts the lock once; interrupts are left untouched on failure.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T, M>> {
        let state = M::save_and_disable();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqSpinLockGuard { guard: ManuallyDrop::new(guard), state }),
            None => {
                M::restore(state);
                None
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Exclusive access without locking; the borrow proves no other holder exists.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Default, M: InterruptMask> Default for IrqSpinLock<T, M> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct IrqSpinLockGuard<'a, T: ?Sized, M: InterruptMask> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    state: M::State,
}

impl<'a, T: ?Sized, M: InterruptMask> Deref for IrqSpinLockGuard<'a, T, M> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T: ?Sized, M: InterruptMask> DerefMut for IrqSpinLockGuard<'a, T, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<'a, T: ?Sized, M: InterruptMask> Drop for IrqSpinLockGuard<'a, T, M> {
    fn drop(&mut self) {
        // SAFETY: the guard is dropped exactly once, here, before unmasking.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        M::restore(self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::{InterruptMask, IrqSpinLock};
    use std::cell::Cell;

    thread_local! {
        static MASK_DEPTH: Cell<usize> = const { Cell::new(0) };
    }

    struct CountingMask;

    impl InterruptMask for CountingMask {
        type State = usize;

        fn save_and_disable() -> usize {
            MASK_DEPTH.with(|depth| {
                let previous = depth.get();
                depth.set(previous + 1);
                previous
            })
        }

        fn restore(state: usize) {
            MASK_DEPTH.with(|depth| depth.set(state));
        }
    }

    fn depth() -> usize {
        MASK_DEPTH.with(Cell::get)
    }

    #[test]
    fn guard_masks_for_its_lifetime() {
        let lock: IrqSpinLock<u32, CountingMask> = IrqSpinLock::new(1);
        {
            let mut guard = lock.lock();
            assert_eq!(depth(), 1);
            *guard += 1;
        }
        assert_eq!(depth(), 0);
        assert_eq!(*lock.lock(), 2);
    }

    #[test]
    fn nested_locks_restore_in_order() {
        let outer: IrqSpinLock<(), CountingMask> = IrqSpinLock::new(());
        let inner: IrqSpinLock<(), CountingMask> = IrqSpinLock::new(());
        let a = outer.lock();
        let b = inner.lock();
        assert_eq!(depth(), 2);
        drop(b);
        assert_eq!(depth(), 1);
        drop(a);
        assert_eq!(depth(), 0);
    }

    #[test]
    fn failed_try_lock_leaves_mask_untouched() {
        let lock: IrqSpinLock<u8, CountingMask> = IrqSpinLock::new(0);
        let held = lock.lock();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        assert_eq!(depth(), 1);
        drop(held);
        assert!(lock.try_lock().is_some());
        assert_eq!(depth(), 0);
    }

    #[test]
    fn contended_increments_are_not_lost() {
        let lock: IrqSpinLock<u64> = IrqSpinLock::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(lock.into_inner(), 40_000);
    }
}
