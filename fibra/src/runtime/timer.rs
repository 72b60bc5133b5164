//! Deadline timers.
//!
//! A [`DeadlineTimer`] arms a single outstanding wait against a lazily
//! started global driver thread. Completion handlers are posted to the
//! timer's executor and fire exactly once: `Ok(())` on expiry,
//! `Err(TimerError::Cancelled)` when the wait is cancelled first.

use crate::runtime::executor::Executor;
use parking_lot::{Condvar, Mutex};
use std::collections::BinaryHeap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    /// The wait was cancelled before the deadline expired.
    #[error("timer wait cancelled before expiry")]
    Cancelled,
}

type WaitHandler = Box<dyn FnOnce(Result<(), TimerError>) + Send>;

/// A single armed wait. The handler slot arbitrates the expiry/cancel race:
/// whoever takes the handler delivers the result.
struct WaitEntry {
    executor: Arc<dyn Executor>,
    handler: Mutex<Option<WaitHandler>>,
}

impl WaitEntry {
    /// Delivers `result` through the executor if the wait is still armed.
    /// Returns `true` iff this call claimed the handler.
    fn fire(&self, result: Result<(), TimerError>) -> bool {
        match self.handler.lock().take() {
            Some(handler) => {
                self.executor.post(Box::new(move || handler(result)));
                true
            }
            None => false,
        }
    }
}

/// A one-shot deadline timer bound to an executor.
pub struct DeadlineTimer {
    executor: Arc<dyn Executor>,
    deadline: Instant,
    pending: Option<Arc<WaitEntry>>,
}

impl DeadlineTimer {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        DeadlineTimer {
            executor,
            deadline: Instant::now(),
            pending: None,
        }
    }

    /// Moves the deadline to `duration` from now, cancelling any wait that
    /// is still armed.
    pub fn expires_after(&mut self, duration: Duration) -> bool {
        let cancelled = self.cancel();
        self.deadline = Instant::now() + duration;
        cancelled
    }

    /// Arms a wait against the current deadline. The handler fires exactly
    /// once, on the timer's executor.
    pub fn async_wait<F>(&mut self, handler: F)
    where
        F: FnOnce(Result<(), TimerError>) + Send + 'static,
    {
        let entry = Arc::new(WaitEntry {
            executor: Arc::clone(&self.executor),
            handler: Mutex::new(Some(Box::new(handler))),
        });
        self.pending = Some(Arc::clone(&entry));
        driver().register(self.deadline, entry);
    }

    /// Cancels the armed wait, if any. Returns `true` iff a wait was still
    /// armed; its handler then fires with `Err(TimerError::Cancelled)`.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(entry) => entry.fire(Err(TimerError::Cancelled)),
            None => false,
        }
    }
}

struct DriverSlot {
    deadline: Instant,
    seq: u64,
    entry: Arc<WaitEntry>,
}

// BinaryHeap is a max-heap; order slots by reversed deadline so the earliest
// deadline surfaces first. `seq` makes the order total.
impl Ord for DriverSlot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DriverSlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DriverSlot {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for DriverSlot {}

struct Driver {
    queue: Mutex<DriverQueue>,
    tick: Condvar,
}

struct DriverQueue {
    slots: BinaryHeap<DriverSlot>,
    next_seq: u64,
}

impl Driver {
    fn register(&self, deadline: Instant, entry: Arc<WaitEntry>) {
        let mut queue = self.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.slots.push(DriverSlot {
            deadline,
            seq,
            entry,
        });
        self.tick.notify_one();
    }

    fn run(&self) {
        let mut queue = self.queue.lock();
        loop {
            let now = Instant::now();

            while queue
                .slots
                .peek()
                .is_some_and(|slot| slot.deadline <= now)
            {
                let slot = queue.slots.pop().expect("peeked slot missing");
                // A cancelled wait leaves its slot behind; firing it is a
                // no-op because the handler is already gone.
                slot.entry.fire(Ok(()));
            }

            match queue.slots.peek().map(|slot| slot.deadline) {
                Some(deadline) => {
                    let _ = self.tick.wait_until(&mut queue, deadline);
                }
                None => {
                    self.tick.wait(&mut queue);
                }
            }
        }
    }
}

/// The global timer driver, started on first use.
fn driver() -> &'static Driver {
    static DRIVER: OnceLock<&'static Driver> = OnceLock::new();
    DRIVER.get_or_init(|| {
        let driver: &'static Driver = Box::leak(Box::new(Driver {
            queue: Mutex::new(DriverQueue {
                slots: BinaryHeap::new(),
                next_seq: 0,
            }),
            tick: Condvar::new(),
        }));

        std::thread::Builder::new()
            .name("fibra-timer".to_string())
            .spawn(move || driver.run())
            .expect("failed to spawn timer driver thread");

        driver
    })
}
