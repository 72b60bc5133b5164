//! The executor side of the runtime: the [`Executor`] seam tasks are
//! scheduled onto, a worker [`ThreadPool`] implementation, and the
//! [`DeadlineTimer`] used by `Task::sleep`.

pub mod builder;
pub use builder::Builder;

pub mod executor;
pub use executor::{Executor, Work, WorkGuard};

pub mod pool;
pub use pool::ThreadPool;

pub mod timer;
pub use timer::{DeadlineTimer, TimerError};
