//! Configuration for the worker thread pool.

use crate::runtime::pool::ThreadPool;
use anyhow::{bail, Result};

/// Builds a [`ThreadPool`].
///
/// Same consuming-builder shape as [`Task::builder`](crate::Task::builder):
/// chain the knobs you care about, then `try_build`.
///
/// ```no_run
/// use fibra::runtime::Builder;
///
/// let pool = Builder::new()
///     .worker_threads(4)
///     .name_prefix("app-io")
///     .try_build()
///     .unwrap();
/// ```
pub struct Builder {
    worker_threads: Option<usize>,
    name_prefix: String,
    worker_stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            worker_threads: None,
            name_prefix: "fibra-worker".to_string(),
            worker_stack_size: None,
        }
    }

    /// How many worker threads the pool runs. Defaults to one per CPU core.
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count);
        self
    }

    /// Prefix for worker thread names; worker `i` is named `<prefix>-<i>`.
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// OS stack size, in bytes, for the worker threads. This is unrelated to
    /// the per-task stacks, which tasks allocate for themselves.
    pub fn worker_stack_size(mut self, bytes: usize) -> Self {
        self.worker_stack_size = Some(bytes);
        self
    }

    pub fn try_build(self) -> Result<ThreadPool> {
        let worker_threads = match self.worker_threads {
            Some(0) => bail!("pool needs at least one worker thread"),
            Some(count) => count,
            None => std::thread::available_parallelism().map_or(1, |n| n.get()),
        };

        ThreadPool::new(worker_threads, self.name_prefix, self.worker_stack_size)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}
