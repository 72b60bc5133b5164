//! The per-task atomic state word.
//!
//! A single `u32` carries both the task's lifecycle flags and two short
//! spin-lock bits protecting auxiliary fields. It is the only lock-free
//! coordination point between a task, its wakers, and introspection callers.

use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    /// Snapshot of a task's state word. All bits outside this set are
    /// reserved and read as zero.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct StateFlags: u32 {
        /// The task requested a signal because it is awaiting an external
        /// asynchronous event.
        const NEED_SIGNAL = 1 << 0;

        /// The completion handler generated by an await was invoked.
        const HAVE_SIGNAL = 1 << 1;

        /// The task is not currently running on any thread.
        const SUSPENDED = 1 << 2;

        /// The task body has finished execution. Never cleared once set.
        const TERMINATED = 1 << 3;

        /// A stack trace was requested; the task must record one the next
        /// time it resumes, instead of returning to user code.
        const STACK_TRACE = 1 << 4;

        /// Spin-lock bit serializing access to the sleep timer.
        const SLEEP_TIMER_LOCK = 1 << 5;

        /// Spin-lock bit serializing access to the completion-handler list.
        const COMPLETION_HANDLERS_LOCK = 1 << 6;

        /// Saved value of `SLEEP_TIMER_LOCK` while the task is suspended.
        /// A suspended task must hold no spin locks, so the sleep path's
        /// lock is released across the suspension and re-acquired on resume.
        const SLEEP_TIMER_LOCK_SUSPEND = 1 << 7;
    }
}

impl StateFlags {
    const SIGNAL_BITS: StateFlags = StateFlags::NEED_SIGNAL.union(StateFlags::HAVE_SIGNAL);

    /// True iff the snapshot is *not* a suspended state.
    pub(crate) fn is_running(self) -> bool {
        !self.contains(StateFlags::SUSPENDED)
    }

    /// True iff the task is suspended and ready to be resumed: not
    /// terminated, no pending stack-trace request, and either no signal is
    /// involved or the awaited signal has arrived.
    pub(crate) fn is_ready(self) -> bool {
        let signals = self & StateFlags::SIGNAL_BITS;
        self.contains(StateFlags::SUSPENDED)
            && !self.intersects(StateFlags::TERMINATED | StateFlags::STACK_TRACE)
            && (signals.is_empty() || signals == StateFlags::SIGNAL_BITS)
    }

    /// True iff the snapshot represents a fully terminated task.
    pub(crate) fn is_terminal(self) -> bool {
        self.contains(StateFlags::SUSPENDED | StateFlags::TERMINATED)
    }
}

/// The atomic cell holding a task's state word.
///
/// All read-modify-write operations are `AcqRel`: the `fetch_or` performed
/// by a signaling handler must synchronize with the task's loads after it
/// resumes, and lock releases must publish the protected fields.
pub(crate) struct StateCell(AtomicU32);

impl StateCell {
    /// Tasks start suspended; construction schedules the first activation.
    pub(crate) fn new() -> Self {
        StateCell(AtomicU32::new(StateFlags::SUSPENDED.bits()))
    }

    pub(crate) fn load(&self) -> StateFlags {
        StateFlags::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    /// Atomically ORs `flags` in, returning the *prior* snapshot.
    pub(crate) fn fetch_or(&self, flags: StateFlags) -> StateFlags {
        StateFlags::from_bits_retain(self.0.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Atomically clears `flags`, returning the *prior* snapshot.
    pub(crate) fn fetch_clear(&self, flags: StateFlags) -> StateFlags {
        StateFlags::from_bits_retain(self.0.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    pub(crate) fn compare_exchange_weak(
        &self,
        current: StateFlags,
        new: StateFlags,
    ) -> Result<StateFlags, StateFlags> {
        self.0
            .compare_exchange_weak(
                current.bits(),
                new.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(StateFlags::from_bits_retain)
            .map_err(StateFlags::from_bits_retain)
    }

    /// Acquires a spin lock on the given bit, yielding the thread between
    /// attempts. `lock` must be `SLEEP_TIMER_LOCK` or
    /// `COMPLETION_HANDLERS_LOCK`. The locks are not reentrant.
    pub(crate) fn spin_lock(&self, lock: StateFlags) -> StateFlags {
        loop {
            if let Some(prior) = self.try_spin_lock(lock) {
                return prior;
            }
            std::thread::yield_now();
        }
    }

    /// Tries once to acquire the lock bit, returning the prior snapshot on
    /// success.
    pub(crate) fn try_spin_lock(&self, lock: StateFlags) -> Option<StateFlags> {
        let prior = self.fetch_or(lock);
        (!prior.contains(lock)).then_some(prior)
    }

    /// Releases a lock bit previously acquired by this thread.
    pub(crate) fn spin_unlock(&self, lock: StateFlags) {
        self.fetch_clear(lock);
    }
}

impl std::fmt::Debug for StateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.load().fmt(f)
    }
}

/// Holds a state-word spin lock; released on drop.
pub(crate) struct SpinLockGuard<'a> {
    state: &'a StateCell,
    lock: StateFlags,
}

impl<'a> SpinLockGuard<'a> {
    pub(crate) fn new(state: &'a StateCell, lock: StateFlags) -> Self {
        state.spin_lock(lock);
        SpinLockGuard { state, lock }
    }
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        self.state.spin_unlock(self.lock);
    }
}
