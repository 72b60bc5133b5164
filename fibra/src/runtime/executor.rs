//! The executor seam the task runtime schedules onto.

use std::sync::Arc;

/// A unit of work submitted to an executor. Invoked exactly once.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// A thread pool (or equivalent) that the runtime submits activations to.
///
/// The runtime owns no threads of its own; everything a task does between
/// suspensions happens inside a `Work` item handed to one of these two
/// submission modes.
pub trait Executor: Send + Sync + 'static {
    /// Submits `work`, running it inline when the calling thread is allowed
    /// to execute this executor's work. Falls back to [`post`] otherwise.
    ///
    /// [`post`]: Executor::post
    fn dispatch(&self, work: Work);

    /// Submits `work` for asynchronous execution. Never runs inline.
    fn post(&self, work: Work);

    /// Work accounting backing [`WorkGuard`]. While the count is nonzero the
    /// executor must not drain and stop its threads.
    fn work_started(&self);

    /// Balances a prior [`work_started`].
    ///
    /// [`work_started`]: Executor::work_started
    fn work_finished(&self);
}

/// Keeps an executor alive for as long as the guard exists.
///
/// Every task holds one for its whole lifetime, so the executor cannot drain
/// while the task still has work to do.
pub struct WorkGuard {
    executor: Arc<dyn Executor>,
}

impl WorkGuard {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        executor.work_started();
        WorkGuard { executor }
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.executor.work_finished();
    }
}
