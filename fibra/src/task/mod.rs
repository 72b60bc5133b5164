//! Lightweight stackful tasks scheduled cooperatively on an executor.
//!
//! A [`Task`] owns its own call stack. It runs until it yields, awaits an
//! asynchronous event, sleeps, or returns; the runtime then hands the thread
//! back to the executor. A single atomic state word (see [`state`])
//! coordinates the task with its wakers and with introspection callers.

use crate::context;
use crate::future::Promise;
use crate::runtime::{DeadlineTimer, Executor, TimerError, WorkGuard};
use crate::task::state::{SpinLockGuard, StateCell, StateFlags};
use crate::utils::ScopeGuard;
use anyhow::{Context as _, Result};
use backtrace::Backtrace;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::{Cell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub mod debug;
pub use debug::DebugScope;

mod handler;
pub use handler::SignalHandler;
use handler::{CompletionHandlers, ThreadSlot};

pub mod registry;
pub use registry::backtrace_all;

pub(crate) mod state;

#[cfg(test)]
mod tests;

/// Default per-task stack size in bytes.
pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;

type TaskCoroutine = Coroutine<(), (), (), DefaultStack>;

/// A user-space cooperatively scheduled thread of control.
///
/// Tasks are created with [`Task::spawn`] (or [`Task::builder`] for
/// non-default name, stack size, or priority) and start running as soon as
/// the executor picks them up. The handle is reference counted; the runtime
/// itself keeps a task alive through its pending activations, so dropping
/// the handle detaches rather than cancels.
///
/// ```no_run
/// use fibra::runtime::Builder;
/// use fibra::Task;
/// use std::time::Duration;
///
/// let pool = Builder::new().worker_threads(2).try_build().unwrap();
/// let task = Task::spawn(&pool.executor(), || {
///     Task::sleep(Duration::from_millis(10)).unwrap();
/// })
/// .unwrap();
/// task.join();
/// ```
pub struct Task {
    id: i32,
    name: String,
    priority: AtomicI32,
    executor: Arc<dyn Executor>,

    /// Lifecycle flags and spin-lock bits; the sole lock-free coordination
    /// point of the task.
    state: StateCell,

    /// The task's own stackful context. Exclusive to the single live
    /// activation admitted by the state machine.
    coroutine: UnsafeCell<Option<TaskCoroutine>>,

    /// The context that last resumed the task. Set on entry, cleared when
    /// the body finishes; only the task's own stack reaches it.
    yielder: Cell<Option<NonNull<Yielder<(), ()>>>>,

    /// Guarded by `SLEEP_TIMER_LOCK` (handed off across suspensions).
    sleep_timer: UnsafeCell<Option<DeadlineTimer>>,

    /// Written by the task under the `STACK_TRACE` protocol, read by the
    /// requesting thread after the task suspends again.
    stack_trace: UnsafeCell<Option<Backtrace>>,

    /// Guarded by `COMPLETION_HANDLERS_LOCK`.
    completion_handlers: UnsafeCell<CompletionHandlers>,

    /// Fulfilled exactly once, at termination. `join` awaits it.
    done: Promise<()>,

    /// Address recorded at the base of the task stack; `stack_pos` measures
    /// depth against it.
    stack_base: AtomicUsize,

    debug_frames: parking_lot::Mutex<Vec<String>>,

    me: Weak<Task>,
}

// Safety: shared mutable fields are each protected by a documented protocol:
// `coroutine` by single-activation (the CAS in `schedule_to_run`, plus the
// `STACK_TRACE` CAS for introspection resumes), `sleep_timer` and
// `completion_handlers` by their state-word spin locks, `stack_trace` by the
// `STACK_TRACE` bit, and `yielder` by being touched only from the task's own
// stack. Everything else is atomic or immutable after construction.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

/// Configures and spawns a [`Task`].
pub struct TaskBuilder {
    name: String,
    stack_size: usize,
    priority: Option<i32>,
}

impl TaskBuilder {
    fn new() -> Self {
        TaskBuilder {
            name: default_name(),
            stack_size: DEFAULT_STACK_SIZE,
            priority: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the size of the task's own stack, in bytes. Rounded up to page
    /// granularity by the stack allocator.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Sets the task's priority. Defaults to the spawning task's priority
    /// plus 100, or 0 when spawned outside a task. Priority is advisory
    /// metadata for the executor; the runtime itself does not order by it.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Allocates the stack, links the task into the global list, and
    /// schedules its first activation on `executor`.
    pub fn spawn<F>(self, executor: &Arc<dyn Executor>, body: F) -> Result<Arc<Task>>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = DefaultStack::new(self.stack_size)
            .context("failed to allocate task stack")?;
        let priority = self.priority.unwrap_or_else(|| match context::current_task() {
            Some(parent) => parent.priority().saturating_add(100),
            None => 0,
        });

        let task = Arc::new_cyclic(|me: &Weak<Task>| Task {
            id: context::next_task_id(),
            name: self.name,
            priority: AtomicI32::new(priority),
            executor: Arc::clone(executor),
            state: StateCell::new(),
            coroutine: UnsafeCell::new(Some(make_coroutine(
                me.clone(),
                Arc::clone(executor),
                stack,
                body,
            ))),
            yielder: Cell::new(None),
            sleep_timer: UnsafeCell::new(None),
            stack_trace: UnsafeCell::new(None),
            completion_handlers: UnsafeCell::new(CompletionHandlers::new()),
            done: Promise::new(),
            stack_base: AtomicUsize::new(0),
            debug_frames: parking_lot::Mutex::new(Vec::new()),
            me: me.clone(),
        });

        // Run the prologue up to its first suspension so the stack base and
        // yielder are recorded before the task becomes schedulable.
        task.prime();
        tracing::trace!(
            id = task.id,
            name = %task.name,
            thread = context::this_thread_id(),
            "task created"
        );

        registry::link(&task);
        task.handle_event(StateFlags::SUSPENDED);

        Ok(task)
    }
}

fn default_name() -> String {
    "(anonymous)".to_string()
}

fn make_coroutine<F>(
    me: Weak<Task>,
    executor: Arc<dyn Executor>,
    stack: DefaultStack,
    body: F,
) -> TaskCoroutine
where
    F: FnOnce() + Send + 'static,
{
    Coroutine::with_stack(stack, move |yielder, ()| {
        // Whichever activation resumed this stack holds its own strong
        // reference until `run` returns, so this reference is never the last
        // one when the closure unwinds off the coroutine stack.
        let task = me.upgrade().expect("task dropped during its own coroutine entry");

        let _work = WorkGuard::new(executor);
        task.enter(yielder);

        tracing::trace!(
            id = task.id,
            name = %task.name,
            thread = context::this_thread_id(),
            "task started"
        );

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
            tracing::warn!(
                id = task.id,
                name = %task.name,
                payload = panic_message(payload.as_ref()),
                "task body exited via unhandled panic"
            );
        }

        task.finish();
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "(opaque panic payload)"
    }
}

impl Task {
    /// Starts a task with default name, stack size, and priority.
    pub fn spawn<F>(executor: &Arc<dyn Executor>, body: F) -> Result<Arc<Task>>
    where
        F: FnOnce() + Send + 'static,
    {
        Task::builder().spawn(executor, body)
    }

    pub fn builder() -> TaskBuilder {
        TaskBuilder::new()
    }

    /// Returns the task currently running on this thread, if any.
    pub fn current() -> Option<Arc<Task>> {
        context::current_task()
    }

    /// Yields control, letting peer work run. Outside a task this yields
    /// the OS thread.
    pub fn yield_now() {
        match context::current_task() {
            Some(task) => task.suspend(),
            None => std::thread::yield_now(),
        }
    }

    /// Puts the current task (or, outside a task, the current thread) to
    /// sleep. Returns `Err(TimerError::Cancelled)` when a peer cuts the
    /// sleep short with [`wake`](Task::wake).
    pub fn sleep(duration: Duration) -> std::result::Result<(), TimerError> {
        match context::current_task() {
            Some(task) => task.sleep_impl(duration),
            None => {
                std::thread::sleep(duration);
                Ok(())
            }
        }
    }

    /// Suspends until an asynchronous operation completes, returning its
    /// result synchronously.
    ///
    /// `f` receives the [`SignalHandler`] continuation and is expected to
    /// hand it to an async-style API; the handler must be completed exactly
    /// once, from any thread, synchronously or later. Outside a task the
    /// calling OS thread blocks instead of suspending.
    ///
    /// ```no_run
    /// # use fibra::Task;
    /// let (code, message) = Task::await_on(|handler| {
    ///     // some_async_api(move |code, message| handler.complete((code, message)))
    ///     # handler.complete((0i32, "ok".to_string()));
    /// });
    /// ```
    pub fn await_on<R, F>(f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(SignalHandler<R>),
    {
        if let Some(task) = context::current_task() {
            return task.await_impl(f);
        }

        // No task on this thread: block it on a rendezvous slot instead.
        let slot = Arc::new(ThreadSlot::new());
        f(SignalHandler::for_thread(Arc::clone(&slot)));
        slot.take_blocking()
    }

    /// Awaits a one-shot future's value.
    pub fn await_future<T>(future: crate::future::Future<T>) -> T
    where
        T: Clone + Send + 'static,
    {
        Task::await_on(move |handler| future.async_wait(move |value| handler.complete(value)))
    }

    /// The priority of the current task, or 0 outside a task.
    pub fn current_priority() -> i32 {
        context::current_task().map_or(0, |task| task.priority())
    }

    //==================================================================
    // Instance surface.

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Blocks until this task terminates. Callable from another task (which
    /// suspends) or from a plain OS thread (which blocks).
    pub fn join(&self) {
        Task::await_future(self.done.future());
    }

    /// Cuts short this task's current sleep, if any. Returns `true` iff a
    /// still-armed sleep timer was cancelled; its `sleep` then returns
    /// `Err(TimerError::Cancelled)`.
    pub fn wake(&self) -> bool {
        let _lock = SpinLockGuard::new(&self.state, StateFlags::SLEEP_TIMER_LOCK);

        // Safety: serialized by SLEEP_TIMER_LOCK.
        match unsafe { &mut *self.sleep_timer.get() } {
            Some(timer) => timer.cancel(),
            None => false,
        }
    }

    /// Registers `handler` to run when this task terminates; runs it
    /// immediately if the task already has. Handlers observe the task's
    /// completion promise as already fulfilled, so a handler may `join`
    /// without blocking.
    pub fn call_when_done<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.state.load().contains(StateFlags::TERMINATED) {
            handler();
            return;
        }

        {
            let _lock = SpinLockGuard::new(&self.state, StateFlags::COMPLETION_HANDLERS_LOCK);
            if !self.state.load().contains(StateFlags::TERMINATED) {
                // Safety: serialized by COMPLETION_HANDLERS_LOCK.
                unsafe { (*self.completion_handlers.get()).push(Box::new(handler)) };
                return;
            }
            // Terminated while we waited for the lock; the terminal drain
            // may already have passed this list by, so run the handler
            // directly (outside the lock).
        }
        handler();
    }

    /// Stack bytes in use at the call site, measured against the recorded
    /// stack base. Only meaningful when called from within the task.
    pub fn stack_pos(&self) -> usize {
        let marker: u8 = 0;
        let here = std::hint::black_box(&marker) as *const u8 as usize;
        self.stack_base.load(Ordering::Relaxed).abs_diff(here)
    }

    pub(crate) fn debug_frames(&self) -> &parking_lot::Mutex<Vec<String>> {
        &self.debug_frames
    }

    //==================================================================
    // Continuation handoff.

    fn arc(&self) -> Arc<Task> {
        self.me.upgrade().expect("task has no outstanding references")
    }

    /// Runs the coroutine prologue (up to its first suspension) on the
    /// constructing thread.
    fn prime(&self) {
        // Safety: pre-publication; no other thread can reach the coroutine
        // yet.
        let coroutine = unsafe { &mut *self.coroutine.get() };
        match coroutine
            .as_mut()
            .expect("task coroutine missing")
            .resume(())
        {
            CoroutineResult::Yield(()) => {}
            CoroutineResult::Return(()) => unreachable!("task finished before entering its body"),
        }
    }

    /// First code on the task stack: record the stack base and the parent
    /// context, then suspend so the body runs via the executor.
    fn enter(&self, yielder: &Yielder<(), ()>) {
        let base: u8 = 0;
        self.stack_base.store(
            std::hint::black_box(&base) as *const u8 as usize,
            Ordering::Relaxed,
        );
        self.yielder.set(Some(NonNull::from(yielder)));

        yielder.suspend(());
    }

    /// Last code on the task stack after the body returns.
    fn finish(&self) {
        self.yielder.set(None);
        self.handle_event(StateFlags::TERMINATED);
        // The final switch back to the resuming thread happens when the
        // coroutine closure returns; termination completes there, in `run`,
        // once SUSPENDED is set.
    }

    /// Suspends the task, resuming the context that activated it. On the
    /// way back in, a pending stack-trace request is serviced before user
    /// code continues.
    fn suspend(&self) {
        debug_assert!(
            !self
                .state
                .load()
                .contains(StateFlags::COMPLETION_HANDLERS_LOCK),
            "task suspending while holding the completion-handlers lock"
        );

        let yielder = self.yielder.get().expect("task suspending outside its body");
        loop {
            // Safety: set in `enter`, cleared in `finish`; valid for the
            // whole stretch in which the body can suspend, and only this
            // task's own stack reaches it.
            unsafe { yielder.as_ref() }.suspend(());

            if self.state.load().contains(StateFlags::STACK_TRACE) {
                // Resumed for introspection, not to run: record the trace
                // and give the stack back to the requester.
                //
                // Safety: the requesting thread owns the slot until it
                // clears STACK_TRACE, and it is blocked in `switch_into`
                // until we suspend again.
                unsafe { *self.stack_trace.get() = Some(Backtrace::new_unresolved()) };
                continue;
            }
            break;
        }
    }

    /// Switches the current thread into the task.
    fn switch_into(&self) {
        let saved = context::swap_current_task(Some(self.arc()));
        assert!(
            !saved.as_deref().is_some_and(|prev| std::ptr::eq(prev, self)),
            "task attempted to resume itself"
        );
        let _restore = ScopeGuard::new(move || {
            context::swap_current_task(saved);
        });

        // Safety: the state machine admits one live activation at a time
        // (the ready CAS in `schedule_to_run`, or the STACK_TRACE CAS for
        // introspection), so this thread has exclusive coroutine access.
        let coroutine = unsafe { &mut *self.coroutine.get() };
        coroutine
            .as_mut()
            .expect("task coroutine missing")
            .resume(());
    }

    //==================================================================
    // Lifecycle driver.

    /// Applies a state event and reacts to the state it produces: schedules
    /// the task when it became ready, completes termination when it became
    /// terminal. Safe to invoke from inside the task or from any other
    /// thread.
    pub(crate) fn handle_event(&self, event: StateFlags) {
        debug_assert!(
            event == StateFlags::HAVE_SIGNAL
                || event == StateFlags::SUSPENDED
                || event == StateFlags::TERMINATED,
            "not a state event: {event:?}"
        );

        let new_state = self.state.fetch_or(event) | event;

        if new_state.is_ready() {
            self.schedule_to_run(new_state, false);
        } else if new_state.is_terminal() {
            let handlers = self.take_completion_handlers();

            tracing::trace!(id = self.id, name = %self.name, "task terminated");
            self.done.set(());

            // Handlers run after the promise so a handler that joins this
            // task returns immediately.
            for handler in handlers {
                handler();
            }
        }
    }

    /// Claims the ready-to-running transition and submits an activation to
    /// the executor. Of several racing callers, exactly one wins the CAS
    /// and submits; the rest see a non-ready snapshot and return.
    ///
    /// The synchronous `dispatch` path is used while this thread's nesting
    /// depth is below the cap (and `force_post` is not set); otherwise the
    /// activation is posted, bounding stack growth through activation
    /// chains.
    fn schedule_to_run(&self, mut observed: StateFlags, force_post: bool) {
        loop {
            if !observed.is_ready() {
                return;
            }
            let target = observed
                & !(StateFlags::SUSPENDED | StateFlags::NEED_SIGNAL | StateFlags::HAVE_SIGNAL);
            match self.state.compare_exchange_weak(observed, target) {
                Ok(_) => break,
                Err(actual) => observed = actual,
            }
        }

        let task = self.arc();
        let activation = Box::new(move || task.run());

        if !force_post {
            if let Some(_depth) = context::try_enter_dispatch() {
                self.executor.dispatch(activation);
                return;
            }
        }
        self.executor.post(activation);
    }

    /// The activation body: re-acquire a handed-off sleep-timer lock,
    /// resume the task until it suspends again, hand the lock back off if
    /// it is still held, then report the suspension.
    fn run(&self) {
        let mut observed = self.state.load();
        if observed.contains(StateFlags::SLEEP_TIMER_LOCK_SUSPEND) {
            loop {
                if observed.contains(StateFlags::SLEEP_TIMER_LOCK) {
                    // A waker holds the real lock; it is short.
                    std::hint::spin_loop();
                    observed = self.state.load();
                    continue;
                }
                let target = (observed - StateFlags::SLEEP_TIMER_LOCK_SUSPEND)
                    | StateFlags::SLEEP_TIMER_LOCK;
                match self.state.compare_exchange_weak(observed, target) {
                    Ok(_) => break,
                    Err(actual) => observed = actual,
                }
            }
        }

        self.switch_into();

        let mut observed = self.state.load();
        if observed.contains(StateFlags::SLEEP_TIMER_LOCK) {
            loop {
                let target = (observed - StateFlags::SLEEP_TIMER_LOCK)
                    | StateFlags::SLEEP_TIMER_LOCK_SUSPEND;
                match self.state.compare_exchange_weak(observed, target) {
                    Ok(_) => break,
                    Err(actual) => observed = actual,
                }
            }
        }

        self.handle_event(StateFlags::SUSPENDED);
    }

    //==================================================================
    // await / sleep internals.

    fn await_impl<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(SignalHandler<R>),
    {
        let mut result: Option<R> = None;

        let prior = self.state.fetch_or(StateFlags::NEED_SIGNAL);
        assert!(
            !prior.contains(StateFlags::HAVE_SIGNAL),
            "signal delivered before it was awaited: state={prior:?}"
        );

        f(SignalHandler::for_task(self.arc(), &mut result));

        // Not ready again until HAVE_SIGNAL lands; the handler may already
        // have fired synchronously.
        self.suspend();

        result.take().expect("task resumed from await without a signal")
    }

    fn sleep_impl(&self, duration: Duration) -> std::result::Result<(), TimerError> {
        let _lock = SpinLockGuard::new(&self.state, StateFlags::SLEEP_TIMER_LOCK);

        // Safety: serialized by SLEEP_TIMER_LOCK; `run` keeps the exclusion
        // across the suspension inside `await_impl` by swapping the lock
        // bit for SLEEP_TIMER_LOCK_SUSPEND and back.
        let timer = unsafe { &mut *self.sleep_timer.get() }
            .get_or_insert_with(|| DeadlineTimer::new(Arc::clone(&self.executor)));
        timer.expires_after(duration);

        self.await_impl(|handler| timer.async_wait(move |result| handler.complete(result)))
    }

    //==================================================================
    // Termination / introspection internals.

    fn take_completion_handlers(&self) -> CompletionHandlers {
        let _lock = SpinLockGuard::new(&self.state, StateFlags::COMPLETION_HANDLERS_LOCK);
        // Safety: serialized by COMPLETION_HANDLERS_LOCK.
        unsafe { std::mem::take(&mut *self.completion_handlers.get()) }
    }

    /// Attempts to collect and print this task's stack trace. Fails (and
    /// returns `false`) when the task is running, ready to run, terminal,
    /// or already being dumped.
    pub(crate) fn try_dump_stack_trace(&self) -> bool {
        let mut observed = self.state.load();
        loop {
            if observed.is_running()
                || observed.is_ready()
                || observed.is_terminal()
                || observed.contains(StateFlags::STACK_TRACE)
            {
                return false;
            }
            match self
                .state
                .compare_exchange_weak(observed, observed | StateFlags::STACK_TRACE)
            {
                Ok(_) => break,
                Err(actual) => observed = actual,
            }
        }

        eprintln!("(suspended) state={:?}", self.state.load());

        let frames = self.debug_frames.lock().clone();
        if !frames.is_empty() {
            eprintln!("DEBUG:");
            for frame in frames {
                eprintln!("  {frame}");
            }
        }

        // The task records its trace and immediately suspends again.
        self.switch_into();

        // Safety: STACK_TRACE is still set, so the slot is ours until we
        // clear the bit below.
        let mut trace = unsafe { &mut *self.stack_trace.get() }
            .take()
            .expect("suspended task did not record a stack trace");
        trace.resolve();
        eprintln!("{trace:?}");

        let after = self.state.fetch_clear(StateFlags::STACK_TRACE) - StateFlags::STACK_TRACE;

        // Re-arm normal wakeup. Posting keeps the dumper's stack flat.
        self.schedule_to_run(after, true);

        true
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let state = self.state.load();
        assert!(
            state.is_terminal(),
            "task dropped before terminating: state={state:?}"
        );
        debug_assert!(self.yielder.get().is_none());
        debug_assert!(self
            .coroutine
            .get_mut()
            .as_ref()
            .is_some_and(|coroutine| coroutine.done()));

        registry::unlink(self.id);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state.load())
            .finish()
    }
}
