//! Lightweight stackful tasks scheduled cooperatively on an executor.
//!
//! A [`Task`] is a user-space thread of control with its own call stack. It
//! runs on whatever worker threads its [`Executor`](runtime::Executor) hands
//! it, suspending whenever it yields, awaits an asynchronous event
//! ([`Task::await_on`]), sleeps, or joins another task — and resuming with a
//! plain synchronous return value once the event lands.

pub mod context;
pub use context::this_thread_id;

pub mod future;
pub use future::{Future, Promise};

pub mod runtime;
pub use runtime::{Builder, DeadlineTimer, Executor, ThreadPool, TimerError, WorkGuard};

pub mod task;
pub use task::{backtrace_all, DebugScope, SignalHandler, Task, TaskBuilder};

pub(crate) mod utils;
