//! Process- and thread-level context for the task runtime.
//!
//! Everything here is a process singleton or a thread-local: the monotonic
//! id counters, the current-task pointer, and the dispatch nesting depth
//! that bounds recursive synchronous activation.

use crate::task::Task;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Upper bound on the per-thread dispatch nesting depth. Scheduling a task
/// through the synchronous `dispatch` path past this depth falls back to
/// `post`, keeping the executor thread's call stack bounded.
pub const MAX_NESTING_DEPTH: usize = 8;

static NEXT_TASK_ID: AtomicI32 = AtomicI32::new(1);

static NEXT_THREAD_ID: AtomicI32 = AtomicI32::new(1000);

thread_local! {
    static THIS_THREAD_ID: i32 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);

    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };

    static NESTING_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Issues the next task id. Ids are monotonic and start at 1.
pub(crate) fn next_task_id() -> i32 {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Returns this thread's runtime id, assigning one on first use. Thread ids
/// are monotonic and start at 1000 so they are easy to tell apart from task
/// ids in diagnostic output.
pub fn this_thread_id() -> i32 {
    THIS_THREAD_ID.with(|id| *id)
}

/// Returns the task currently running on this thread, if any.
pub(crate) fn current_task() -> Option<Arc<Task>> {
    CURRENT_TASK.with(|current| current.borrow().clone())
}

/// Installs `task` as this thread's current task, returning the previous one.
pub(crate) fn swap_current_task(task: Option<Arc<Task>>) -> Option<Arc<Task>> {
    CURRENT_TASK.with(|current| current.replace(task))
}

/// Holds one level of dispatch nesting; released on drop.
pub(crate) struct DispatchGuard(());

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        NESTING_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Claims one level of dispatch nesting on this thread. Returns `None` when
/// the depth has reached [`MAX_NESTING_DEPTH`], in which case the caller must
/// schedule asynchronously instead.
pub(crate) fn try_enter_dispatch() -> Option<DispatchGuard> {
    NESTING_DEPTH.with(|depth| {
        if depth.get() < MAX_NESTING_DEPTH {
            depth.set(depth.get() + 1);
            Some(DispatchGuard(()))
        } else {
            None
        }
    })
}

#[cfg(test)]
pub(crate) fn nesting_depth() -> usize {
    NESTING_DEPTH.with(|depth| depth.get())
}
