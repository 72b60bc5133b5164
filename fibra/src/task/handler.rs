//! Completion handlers for the await bridge.

use crate::task::state::StateFlags;
use crate::task::Task;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::ptr::NonNull;
use std::sync::Arc;

/// Handlers registered via `call_when_done`, drained once at termination.
/// Most tasks have at most a couple of watchers; keep them inline.
pub(crate) type CompletionHandlers = SmallVec<[Box<dyn FnOnce() + Send>; 2]>;

/// The continuation of a suspended await.
///
/// An await operation hands one of these to the user-supplied function; the
/// asynchronous API under the bridge invokes it, from any thread, when the
/// operation completes. Calling [`complete`] consumes the handler, so the
/// exactly-once contract is enforced by the type system. Dropping a handler
/// without completing it strands the awaiting context forever.
///
/// [`complete`]: SignalHandler::complete
pub struct SignalHandler<R> {
    target: Target<R>,
}

enum Target<R> {
    /// Signals a suspended task: store the result, raise `HAVE_SIGNAL`.
    ///
    /// The slot points into the awaiting frame on the task's own stack. The
    /// strong reference keeps the task alive while the signal is pending.
    Task {
        task: Arc<Task>,
        slot: NonNull<Option<R>>,
    },

    /// Signals a blocked OS thread (the off-task await path).
    Thread { slot: Arc<ThreadSlot<R>> },
}

// Safety: the raw slot pointer is only written once, from `complete`, and
// the awaiting frame cannot be torn down before that write: the task stays
// suspended until the `HAVE_SIGNAL` raised *after* the write makes it ready
// again (and the thread variant blocks until the slot mutex is filled).
unsafe impl<R: Send> Send for SignalHandler<R> {}

impl<R: Send> SignalHandler<R> {
    pub(crate) fn for_task(task: Arc<Task>, slot: &mut Option<R>) -> Self {
        SignalHandler {
            target: Target::Task {
                task,
                slot: NonNull::from(slot),
            },
        }
    }

    pub(crate) fn for_thread(slot: Arc<ThreadSlot<R>>) -> Self {
        SignalHandler {
            target: Target::Thread { slot },
        }
    }

    /// Delivers the awaited result and wakes the awaiting context.
    pub fn complete(self, value: R) {
        match self.target {
            Target::Task { task, slot } => {
                // Safety: see the `Send` justification above; the awaiting
                // frame is pinned until `handle_event` below delivers the
                // signal.
                unsafe { *slot.as_ptr() = Some(value) };
                task.handle_event(StateFlags::HAVE_SIGNAL);
            }
            Target::Thread { slot } => slot.fill(value),
        }
    }
}

/// Rendezvous for the off-task await path: the handler fills the slot, the
/// blocked thread takes the value.
pub(crate) struct ThreadSlot<R> {
    value: Mutex<Option<R>>,
    filled: Condvar,
}

impl<R> ThreadSlot<R> {
    pub(crate) fn new() -> Self {
        ThreadSlot {
            value: Mutex::new(None),
            filled: Condvar::new(),
        }
    }

    fn fill(&self, value: R) {
        *self.value.lock() = Some(value);
        self.filled.notify_one();
    }

    /// Blocks until the handler delivers, then takes the value.
    pub(crate) fn take_blocking(&self) -> R {
        let mut value = self.value.lock();
        loop {
            if let Some(value) = value.take() {
                return value;
            }
            self.filled.wait(&mut value);
        }
    }
}
