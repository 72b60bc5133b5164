//! One-shot promise/future pair with handler-style completion.
//!
//! A [`Promise`] is fulfilled exactly once; any number of [`Future`] handles
//! observe the value, either through a completion handler (`async_wait`) or
//! by blocking the calling thread (`wait`). Task termination uses a
//! `Promise<()>` as its broadcast point, which is what makes `join` work
//! from both task and non-task contexts.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

type WaitHandler<T> = Box<dyn FnOnce(T) + Send>;

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    fulfilled: Condvar,
}

struct Inner<T> {
    value: Option<T>,
    waiters: Vec<WaitHandler<T>>,
}

/// The fulfilling half of a one-shot channel.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

/// The observing half of a one-shot channel. Cheap to clone.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub fn new() -> Self {
        Promise {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    value: None,
                    waiters: Vec::new(),
                }),
                fulfilled: Condvar::new(),
            }),
        }
    }

    /// Returns a future observing this promise.
    pub fn future(&self) -> Future<T> {
        Future {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Fulfils the promise, waking blocked waiters and invoking registered
    /// handlers in registration order.
    ///
    /// # Panics
    ///
    /// Fulfilling a promise twice is a protocol violation and panics.
    pub fn set(&self, value: T) {
        let waiters = {
            let mut inner = self.shared.inner.lock();
            assert!(inner.value.is_none(), "promise fulfilled twice");
            inner.value = Some(value.clone());
            std::mem::take(&mut inner.waiters)
        };
        self.shared.fulfilled.notify_all();

        // Handlers run outside the lock; they may re-enter this module.
        for waiter in waiters {
            waiter(value.clone());
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Promise::new()
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// Registers a completion handler. If the promise is already fulfilled
    /// the handler is invoked immediately on the calling thread; otherwise
    /// it runs on the fulfilling thread.
    pub fn async_wait<F>(&self, handler: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let ready = {
            let mut inner = self.shared.inner.lock();
            match &inner.value {
                Some(value) => Some((handler, value.clone())),
                None => {
                    inner.waiters.push(Box::new(handler));
                    None
                }
            }
        };
        if let Some((handler, value)) = ready {
            handler(value);
        }
    }

    /// Blocks the calling OS thread until the promise is fulfilled.
    pub fn wait(&self) -> T {
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(value) = &inner.value {
                return value.clone();
            }
            self.shared.fulfilled.wait(&mut inner);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.shared.inner.lock().value.is_some()
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            shared: Arc::clone(&self.shared),
        }
    }
}
