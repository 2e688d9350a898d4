use core::{
    cell::UnsafeCell,
    fmt,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// One CPU's slot, padded to its own cache line.
#[repr(C, align(64))]
struct Slot<T> {
    pinned: AtomicBool,
    value: UnsafeCell<T>,
}

/// Fixed array of per-CPU values.
///
/// Only the owning CPU is supposed to touch its slot. [`PerCpu::pin`] marks the
/// slot busy for the lifetime of the guard, which is what disabling
/// preemption buys in a kernel: nothing else on that CPU can observe the
/// value half-updated. Another CPU pinning the same slot (drain from a
/// remote CPU, a test thread sharing an id) simply spins until it is free.
pub struct PerCpu<T, const N: usize> {
    slots: [Slot<T>; N],
}

// Safety: each slot is handed out to one guard at a time.
unsafe impl<T: Send, const N: usize> Sync for PerCpu<T, N> {}
unsafe impl<T: Send, const N: usize> Send for PerCpu<T, N> {}

impl<T, const N: usize> PerCpu<T, N> {
    pub fn from_fn(mut init: impl FnMut(usize) -> T) -> Self {
        Self {
            slots: core::array::from_fn(|cpu| Slot {
                pinned: AtomicBool::new(false),
                value: UnsafeCell::new(init(cpu)),
            }),
        }
    }

    /// Number of CPU slots.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        N
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        N == 0
    }

    fn slot(&self, cpu: usize) -> &Slot<T> {
        match self.slots.get(cpu) {
            Some(slot) => slot,
            None => panic!("BUG: cpu {cpu} out of range (max {N})"),
        }
    }

    /// Pins `cpu`'s slot, spinning while it is pinned elsewhere.
    ///
    /// # Panics
    /// Panics if `cpu` is not below `N`.
    #[inline]
    pub fn pin(&self, cpu: usize) -> PerCpuGuard<'_, T> {
        let slot = self.slot(cpu);
        while slot
            .pinned
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while slot.pinned.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        PerCpuGuard { slot, cpu }
    }

    /// Pins `cpu`'s slot only if nobody holds it.
    ///
    /// # Panics
    /// Panics if `cpu` is not below `N`.
    #[inline]
    pub fn try_pin(&self, cpu: usize) -> Option<PerCpuGuard<'_, T>> {
        let slot = self.slot(cpu);
        slot.pinned
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| PerCpuGuard { slot, cpu })
    }

    /// Direct access when `&mut self` rules out any pin.
    ///
    /// # Panics
    /// Panics if `cpu` is not below `N`.
    pub fn get_mut(&mut self, cpu: usize) -> &mut T {
        match self.slots.get_mut(cpu) {
            Some(slot) => slot.value.get_mut(),
            None => panic!("BUG: cpu {cpu} out of range (max {N})"),
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().map(|slot| slot.value.get_mut())
    }
}

impl<T: Default, const N: usize> Default for PerCpu<T, N> {
    fn default() -> Self {
        Self::from_fn(|_| T::default())
    }
}

impl<T, const N: usize> fmt::Debug for PerCpu<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerCpu").field("cpus", &N).finish_non_exhaustive()
    }
}

pub struct PerCpuGuard<'a, T> {
    slot: &'a Slot<T>,
    cpu: usize,
}

impl<T> PerCpuGuard<'_, T> {
    /// CPU whose slot this guard pins.
    #[inline]
    #[must_use]
    pub const fn cpu(&self) -> usize {
        self.cpu
    }
}

impl<T> Deref for PerCpuGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the pin flag grants exclusive access to the slot.
        unsafe { &*self.slot.value.get() }
    }
}

impl<T> DerefMut for PerCpuGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the pin flag grants exclusive access to the slot.
        unsafe { &mut *self.slot.value.get() }
    }
}

impl<T> Drop for PerCpuGuard<'_, T> {
    fn drop(&mut self) {
        self.slot.pinned.store(false, Ordering::Release);
    }
}
