//! Interrupt-safe locking.
//!
//! Shared kernel state is touched both from regular code and from interrupt
//! handlers. Holding a plain spinlock while the timer fires on the same CPU
//! deadlocks, so every piece of shared state sits behind an [`IrqMutex`]:
//! taking the lock disables interrupts, and dropping the guard restores the
//! interrupt flag to what it was before.

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::hal::Hardware;

/// Disables interrupts for its lifetime, then restores the previous state.
pub struct InterruptGuard<'a, H: Hardware + ?Sized> {
    hw: &'a H,
    was_enabled: bool,
}

impl<'a, H: Hardware + ?Sized> InterruptGuard<'a, H> {
    pub fn new(hw: &'a H) -> Self {
        let was_enabled = hw.interrupts_enabled();
        if was_enabled {
            hw.disable_interrupts();
        }
        InterruptGuard { hw, was_enabled }
    }
}

impl<H: Hardware + ?Sized> Drop for InterruptGuard<'_, H> {
    fn drop(&mut self) {
        if self.was_enabled {
            self.hw.enable_interrupts();
        }
    }
}

pub struct IrqMutex<T> {
    inner: Mutex<T>,
}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        IrqMutex {
            inner: Mutex::new(value),
        }
    }

    pub fn lock<'a, H: Hardware + ?Sized>(&'a self, hw: &'a H) -> IrqMutexGuard<'a, T, H> {
        let irq = InterruptGuard::new(hw);
        IrqMutexGuard {
            guard: self.inner.lock(),
            _irq: irq,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Lock guard that keeps interrupts off while held.
///
/// Field order matters: the spinlock is released before interrupts come
/// back on.
pub struct IrqMutexGuard<'a, T, H: Hardware + ?Sized> {
    guard: MutexGuard<'a, T>,
    _irq: InterruptGuard<'a, H>,
}

impl<T, H: Hardware + ?Sized> Deref for IrqMutexGuard<'_, T, H> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, H: Hardware + ?Sized> DerefMut for IrqMutexGuard<'_, T, H> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimulatedHardware;

    #[test]
    fn lock_disables_and_restores_interrupts() {
        let hw = SimulatedHardware::new();
        hw.enable_interrupts();
        let counter = IrqMutex::new(0u32);
        {
            let mut value = counter.lock(&hw);
            *value += 1;
            assert!(!hw.interrupts_enabled());
        }
        assert!(hw.interrupts_enabled());
        assert_eq!(*counter.lock(&hw), 1);
    }

    #[test]
    fn lock_leaves_disabled_interrupts_disabled() {
        let hw = SimulatedHardware::new();
        let counter = IrqMutex::new(());
        drop(counter.lock(&hw));
        assert!(!hw.interrupts_enabled());
        assert_eq!(hw.cli_count(), 0);
    }

    #[test]
    fn nested_guards_restore_in_order() {
        let hw = SimulatedHardware::new();
        hw.enable_interrupts();
        let outer = InterruptGuard::new(&hw);
        {
            let _inner = InterruptGuard::new(&hw);
        }
        assert!(!hw.interrupts_enabled());
        drop(outer);
        assert!(hw.interrupts_enabled());
    }
}
