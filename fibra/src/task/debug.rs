//! Debug-info frames for runtime introspection.
//!
//! A [`DebugScope`] tags the enclosing stretch of code with a message. The
//! frames of a task show up when its stack is dumped; frames opened outside
//! any task attach to the OS thread and are listed at the end of
//! [`backtrace_all`](crate::task::backtrace_all).

use crate::context;
use parking_lot::Mutex;
use std::sync::Arc;

type FrameList = Arc<Mutex<Vec<String>>>;

/// Frame lists of every live thread, indexed by runtime thread id.
static THREAD_FRAMES: Mutex<Vec<(i32, FrameList)>> = Mutex::new(Vec::new());

thread_local! {
    static LOCAL_FRAMES: ThreadFramesHandle = ThreadFramesHandle::register();
}

/// Owns this thread's entry in the global index; deregisters on thread exit.
struct ThreadFramesHandle {
    thread_id: i32,
    frames: FrameList,
}

impl ThreadFramesHandle {
    fn register() -> Self {
        let handle = ThreadFramesHandle {
            thread_id: context::this_thread_id(),
            frames: Arc::new(Mutex::new(Vec::new())),
        };
        THREAD_FRAMES
            .lock()
            .push((handle.thread_id, Arc::clone(&handle.frames)));
        handle
    }
}

impl Drop for ThreadFramesHandle {
    fn drop(&mut self) {
        THREAD_FRAMES
            .lock()
            .retain(|(thread_id, _)| *thread_id != self.thread_id);
    }
}

/// Pushes a debug frame for the duration of the scope.
///
/// ```no_run
/// use fibra::DebugScope;
///
/// let _frame = DebugScope::new("waiting for checkpoint flush");
/// // ... a dump taken while this is in scope shows the message ...
/// ```
pub struct DebugScope {
    target: FrameTarget,
}

enum FrameTarget {
    Task(Arc<crate::task::Task>),
    Thread,
}

impl DebugScope {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        match context::current_task() {
            Some(task) => {
                task.debug_frames().lock().push(message);
                DebugScope {
                    target: FrameTarget::Task(task),
                }
            }
            None => {
                LOCAL_FRAMES.with(|handle| handle.frames.lock().push(message));
                DebugScope {
                    target: FrameTarget::Thread,
                }
            }
        }
    }
}

impl Drop for DebugScope {
    fn drop(&mut self) {
        match &self.target {
            FrameTarget::Task(task) => {
                task.debug_frames().lock().pop();
            }
            FrameTarget::Thread => {
                LOCAL_FRAMES.with(|handle| handle.frames.lock().pop());
            }
        }
    }
}

/// Writes every thread's debug frames to stderr.
pub(crate) fn dump_thread_frames() {
    for (thread_id, frames) in THREAD_FRAMES.lock().iter() {
        let frames = frames.lock();
        if frames.is_empty() {
            continue;
        }
        eprintln!("thread {thread_id}:");
        for frame in frames.iter() {
            eprintln!("  {frame}");
        }
    }
}
