use core::{
    hint::spin_loop,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

/// Generation-counting wait queue.
///
/// A waiter takes a [`WaitTicket`], re-checks its condition, and only then
/// waits. Any [`WaitQueue::wake_all`] after the ticket was taken is observed,
/// so the "check, then sleep" window cannot lose a wakeup.
#[derive(Debug, Default)]
pub struct WaitQueue {
    generation: AtomicU64,
    waiters: AtomicUsize,
}

/// Registration on a [`WaitQueue`]; must be handed back through
/// [`WaitQueue::wait`] or [`WaitQueue::cancel`].
#[derive(Debug)]
#[must_use = "a ticket keeps the waiter registered until it is handed back"]
pub struct WaitTicket {
    generation: u64,
}

impl WaitQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Registers the caller as a waiter.
    pub fn prepare(&self) -> WaitTicket {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        WaitTicket {
            generation: self.generation.load(Ordering::SeqCst),
        }
    }

    /// Whether a wakeup happened since `ticket` was taken.
    #[inline]
    pub fn is_woken(&self, ticket: &WaitTicket) -> bool {
        self.generation.load(Ordering::Acquire) != ticket.generation
    }

    /// Spins until woken or `max_spins` polls have passed; returns whether a
    /// wakeup was observed.
    pub fn wait(&self, ticket: WaitTicket, max_spins: u32) -> bool {
        let mut woken = self.is_woken(&ticket);
        let mut spins = 0;
        while !woken && spins < max_spins {
            spin_loop();
            spins += 1;
            woken = self.is_woken(&ticket);
        }
        self.cancel(ticket);
        woken
    }

    /// Deregisters without waiting.
    pub fn cancel(&self, ticket: WaitTicket) {
        let WaitTicket { .. } = ticket;
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wakes every registered waiter. Returns `false` when nobody was waiting.
    pub fn wake_all(&self) -> bool {
        if self.waiters.load(Ordering::SeqCst) == 0 {
            return false;
        }
        self.generation.fetch_add(1, Ordering::Release);
        true
    }

    #[inline]
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_without_waiters_is_a_noop() {
        let q = WaitQueue::new();
        assert!(!q.wake_all());
        let t = q.prepare();
        assert!(!q.is_woken(&t));
        q.cancel(t);
        assert_eq!(q.waiters(), 0);
    }

    #[test]
    fn wakeup_after_prepare_is_seen() {
        let q = WaitQueue::new();
        let t = q.prepare();
        assert!(q.wake_all());
        assert!(q.wait(t, 0));
        assert_eq!(q.waiters(), 0);
    }

    #[test]
    fn wait_times_out() {
        let q = WaitQueue::new();
        let t = q.prepare();
        assert!(!q.wait(t, 16));
    }
}
