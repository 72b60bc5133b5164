//! The global task list and the all-tasks stack dump.

use crate::task::{debug, Task};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Every not-yet-destroyed task, linked at spawn and unlinked from `Drop`.
/// One mutex protects link, unlink, and the full walk; nothing else may
/// touch the list.
static ALL_TASKS: Mutex<Vec<Weak<Task>>> = Mutex::new(Vec::new());

pub(crate) fn link(task: &Arc<Task>) {
    ALL_TASKS.lock().push(Arc::downgrade(task));
}

pub(crate) fn unlink(id: i32) {
    // Entries whose task is already mid-destruction fail to upgrade and are
    // swept out alongside the entry being removed.
    ALL_TASKS
        .lock()
        .retain(|weak| weak.upgrade().is_some_and(|task| task.id() != id));
}

/// Dumps stack traces and debug info for every live task to stderr,
/// followed by the per-thread debug frames. Returns the number of live
/// tasks seen.
///
/// Tasks that are running, ready to run, or terminal cannot be dumped and
/// are listed as `(running)`.
pub fn backtrace_all() -> usize {
    // The walk itself happens off the lock: dumping resumes tasks, and the
    // handles collected here may be the last ones, whose drop re-enters the
    // lock to unlink.
    let tasks: Vec<Arc<Task>> = {
        let all_tasks = ALL_TASKS.lock();
        all_tasks.iter().filter_map(Weak::upgrade).collect()
    };

    eprintln!();
    for task in &tasks {
        eprintln!("-- Task{{id={}, name={}}} -------------", task.id(), task.name());
        if !task.try_dump_stack_trace() {
            eprintln!("(running)");
        }
        eprintln!();
    }
    eprintln!("{} tasks are active", tasks.len());

    debug::dump_thread_frames();

    tasks.len()
}
