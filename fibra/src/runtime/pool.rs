//! A fixed-size worker thread pool implementing [`Executor`].

use crate::runtime::executor::{Executor, Work};
use anyhow::{Context, Result};
use crossbeam_deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

/// How long an idle worker parks before re-checking the queue. Bounds the
/// window in which a wakeup racing with the park could be missed.
const IDLE_PARK_TIMEOUT: Duration = Duration::from_millis(100);

thread_local! {
    // Identity of the pool this thread belongs to, if it is a pool worker.
    // Lets `dispatch` decide whether running inline is allowed.
    static WORKER_OF: Cell<usize> = const { Cell::new(0) };
}

/// A fixed set of worker threads draining a shared injector queue.
///
/// Dropping the pool waits for queued work and outstanding
/// [`WorkGuard`](crate::runtime::WorkGuard)s to finish, then joins the
/// workers.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

pub(crate) struct PoolShared {
    injector: Injector<Work>,

    idle: Mutex<()>,
    wakeup: Condvar,

    shutdown: AtomicBool,

    /// Outstanding work guards. Workers refuse to exit while nonzero.
    work: AtomicUsize,
}

impl ThreadPool {
    pub(crate) fn new(
        worker_threads: usize,
        name_prefix: String,
        worker_stack_size: Option<usize>,
    ) -> Result<Self> {
        let shared = Arc::new(PoolShared {
            injector: Injector::new(),
            idle: Mutex::new(()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            work: AtomicUsize::new(0),
        });

        // Spawning is asynchronous; the barrier makes sure every worker has
        // registered itself before the pool accepts submissions.
        let barrier = Arc::new(Barrier::new(worker_threads + 1));
        let mut handles = Vec::with_capacity(worker_threads);

        for index in 0..worker_threads {
            let mut builder = thread::Builder::new().name(format!("{name_prefix}-{index}"));
            if let Some(stack_size) = worker_stack_size {
                builder = builder.stack_size(stack_size);
            }

            let shared = Arc::clone(&shared);
            let barrier = Arc::clone(&barrier);
            let handle = builder
                .spawn(move || {
                    WORKER_OF.with(|marker| marker.set(Arc::as_ptr(&shared) as usize));
                    barrier.wait();
                    worker_loop(&shared);
                })
                .context("failed to spawn pool worker thread")?;
            handles.push(handle);
        }

        barrier.wait();

        Ok(ThreadPool {
            shared,
            handles: Mutex::new(handles),
        })
    }

    /// Returns the executor handle tasks are spawned onto.
    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.shared) as Arc<dyn Executor>
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wakeup.notify_all();

        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                tracing::warn!("pool worker thread panicked during shutdown");
            }
        }
    }
}

impl Executor for PoolShared {
    fn dispatch(&self, work: Work) {
        let inline = WORKER_OF.with(|marker| marker.get()) == self as *const PoolShared as usize;
        if inline {
            work();
        } else {
            self.post(work);
        }
    }

    fn post(&self, work: Work) {
        self.injector.push(work);
        self.wakeup.notify_one();
    }

    fn work_started(&self) {
        self.work.fetch_add(1, Ordering::AcqRel);
    }

    fn work_finished(&self) {
        self.work.fetch_sub(1, Ordering::AcqRel);
        // A shutting-down pool may be parked waiting for this count to drain.
        self.wakeup.notify_all();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        match shared.injector.steal() {
            Steal::Success(work) => {
                work();
                continue;
            }
            Steal::Retry => continue,
            Steal::Empty => {}
        }

        if shared.shutdown.load(Ordering::Acquire)
            && shared.work.load(Ordering::Acquire) == 0
            && shared.injector.is_empty()
        {
            return;
        }

        let mut idle = shared.idle.lock();
        if shared.injector.is_empty() {
            let _ = shared.wakeup.wait_for(&mut idle, IDLE_PARK_TIMEOUT);
        }
    }
}
