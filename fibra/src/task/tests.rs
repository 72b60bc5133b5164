use super::*;
use crate::context;
use crate::future::Promise;
use crate::runtime::{Builder, ThreadPool, TimerError};
use crate::task::state::StateFlags;
use static_assertions::assert_impl_all;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Instant;

assert_impl_all!(Task: Send, Sync);
assert_impl_all!(SignalHandler<i32>: Send);

fn pool() -> ThreadPool {
    Builder::new().worker_threads(2).try_build().unwrap()
}

/// Polls `cond` until it holds, failing the test after a generous deadline.
fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn is_waiting(task: &Task) -> bool {
    let state = task.state.load();
    state.contains(StateFlags::SUSPENDED | StateFlags::NEED_SIGNAL)
        && !state.contains(StateFlags::HAVE_SIGNAL)
}

#[test]
fn test_basic_yield_and_join() {
    let pool = pool();
    let yields = Arc::new(AtomicUsize::new(0));

    let yields2 = Arc::clone(&yields);
    let task = Task::spawn(&pool.executor(), move || {
        for _ in 0..3 {
            Task::yield_now();
            yields2.fetch_add(1, Ordering::SeqCst);
        }
    })
    .unwrap();

    let weak = Arc::downgrade(&task);
    task.join();
    assert_eq!(yields.load(Ordering::SeqCst), 3);

    // Once the handle is gone and the final activation unwinds, the task is
    // destroyed and drops out of the global list.
    drop(task);
    wait_for("task destruction", || weak.upgrade().is_none());
}

#[test]
fn test_empty_body_terminates_normally() {
    let pool = pool();
    let task = Task::spawn(&pool.executor(), || {}).unwrap();
    task.join();

    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = Arc::clone(&fired);
    task.call_when_done(move || fired2.store(true, Ordering::SeqCst));

    // The task already terminated, so the handler ran synchronously.
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn test_panicking_body_terminates_normally() {
    let pool = pool();
    let task = Task::spawn(&pool.executor(), || panic!("boom")).unwrap();
    task.join();

    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = Arc::clone(&fired);
    task.call_when_done(move || fired2.store(true, Ordering::SeqCst));
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn test_await_with_synchronous_handler() {
    let pool = pool();
    let out = Arc::new(StdMutex::new(None));

    let out2 = Arc::clone(&out);
    let task = Task::spawn(&pool.executor(), move || {
        let result: (i32, String) =
            Task::await_on(|handler| handler.complete((42, "ok".to_string())));
        *out2.lock().unwrap() = Some(result);
    })
    .unwrap();

    task.join();
    assert_eq!(
        out.lock().unwrap().take(),
        Some((42, "ok".to_string()))
    );
}

#[test]
fn test_await_with_delayed_handler_observes_waiting_state() {
    let pool = pool();
    let parked: Arc<StdMutex<Option<SignalHandler<i32>>>> = Arc::new(StdMutex::new(None));
    let out = Arc::new(AtomicUsize::new(0));

    let parked2 = Arc::clone(&parked);
    let out2 = Arc::clone(&out);
    let task = Task::spawn(&pool.executor(), move || {
        let value = Task::await_on(|handler| {
            *parked2.lock().unwrap() = Some(handler);
        });
        out2.store(value as usize, Ordering::SeqCst);
    })
    .unwrap();

    // The task parks with the signal requested but not yet delivered.
    wait_for("task to reach its await", || is_waiting(&task));
    assert!(parked.lock().unwrap().is_some());

    // Deliver the signal from this (non-pool) thread.
    parked.lock().unwrap().take().unwrap().complete(7);

    task.join();
    assert_eq!(out.load(Ordering::SeqCst), 7);
}

#[test]
fn test_await_off_task_blocks_the_calling_thread() {
    let value: i32 = Task::await_on(|handler| {
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            handler.complete(5);
        });
    });
    assert_eq!(value, 5);
}

#[test]
fn test_await_future_returns_the_promised_value() {
    let pool = pool();
    let promise: Promise<i32> = Promise::new();
    let future = promise.future();
    let out = Arc::new(AtomicUsize::new(0));

    let out2 = Arc::clone(&out);
    let task = Task::spawn(&pool.executor(), move || {
        out2.store(Task::await_future(future) as usize, Ordering::SeqCst);
    })
    .unwrap();

    std::thread::sleep(Duration::from_millis(10));
    promise.set(21);

    task.join();
    assert_eq!(out.load(Ordering::SeqCst), 21);
}

#[test]
fn test_sleep_zero_returns_ok() {
    let pool = pool();
    let out = Arc::new(StdMutex::new(None));

    let out2 = Arc::clone(&out);
    let task = Task::spawn(&pool.executor(), move || {
        *out2.lock().unwrap() = Some(Task::sleep(Duration::ZERO));
    })
    .unwrap();

    task.join();
    assert_eq!(out.lock().unwrap().take(), Some(Ok(())));
}

#[test]
fn test_wake_cancels_a_sleeping_task() {
    let pool = pool();
    let out = Arc::new(StdMutex::new(None));

    let out2 = Arc::clone(&out);
    let task = Task::spawn(&pool.executor(), move || {
        *out2.lock().unwrap() = Some(Task::sleep(Duration::from_secs(3600)));
    })
    .unwrap();

    wait_for("task to fall asleep", || is_waiting(&task));
    assert!(task.wake());

    task.join();
    assert_eq!(
        out.lock().unwrap().take(),
        Some(Err(TimerError::Cancelled))
    );

    // Nothing is armed anymore.
    assert!(!task.wake());
}

#[test]
fn test_wake_returns_true_at_most_once_per_sleep() {
    let pool = pool();
    let task = Task::spawn(&pool.executor(), || {
        let _ = Task::sleep(Duration::from_secs(3600));
    })
    .unwrap();

    wait_for("task to fall asleep", || is_waiting(&task));

    let woken = Arc::new(AtomicUsize::new(0));
    let racers: Vec<_> = (0..8)
        .map(|_| {
            let task = Arc::clone(&task);
            let woken = Arc::clone(&woken);
            std::thread::spawn(move || {
                if task.wake() {
                    woken.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for racer in racers {
        racer.join().unwrap();
    }

    assert_eq!(woken.load(Ordering::SeqCst), 1);
    task.join();
}

#[test]
fn test_wake_without_a_sleep_returns_false() {
    let pool = pool();
    let keep_busy = Arc::new(AtomicBool::new(true));

    let keep_busy2 = Arc::clone(&keep_busy);
    let task = Task::spawn(&pool.executor(), move || {
        while keep_busy2.load(Ordering::SeqCst) {
            Task::yield_now();
        }
    })
    .unwrap();

    assert!(!task.wake());
    keep_busy.store(false, Ordering::SeqCst);
    task.join();
}

#[test]
fn test_completion_handler_can_join_without_blocking() {
    let pool = pool();
    let task = Task::spawn(&pool.executor(), || {
        let _ = Task::sleep(Duration::from_millis(10));
    })
    .unwrap();

    let joined = Arc::new(AtomicBool::new(false));
    let joined2 = Arc::clone(&joined);
    let handle = Arc::clone(&task);
    task.call_when_done(move || {
        // The promise is fulfilled before handlers fire, so this join
        // returns immediately.
        handle.join();
        joined2.store(true, Ordering::SeqCst);
    });

    task.join();
    wait_for("completion handler", || joined.load(Ordering::SeqCst));
}

#[test]
fn test_chain_of_joins_terminates_after_the_seed() {
    let pool = pool();
    let executor = pool.executor();
    let finished = Arc::new(AtomicUsize::new(0));

    let mut prev: Option<Arc<Task>> = None;
    for _ in 0..100 {
        let earlier = prev.clone();
        let finished = Arc::clone(&finished);
        let task = Task::builder()
            .stack_size(32 * 1024)
            .spawn(&executor, move || {
                if let Some(earlier) = earlier {
                    earlier.join();
                }
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        prev = Some(task);
    }

    prev.unwrap().join();
    assert_eq!(finished.load(Ordering::SeqCst), 100);
}

#[test]
fn test_signal_cascade_respects_the_nesting_cap() {
    const TASKS: usize = 20;

    let pool = pool();
    let executor = pool.executor();

    let parked: Arc<Vec<StdMutex<Option<SignalHandler<usize>>>>> =
        Arc::new((0..TASKS).map(|_| StdMutex::new(None)).collect());
    let depths = Arc::new(StdMutex::new(Vec::new()));

    let tasks: Vec<Arc<Task>> = (0..TASKS)
        .map(|i| {
            let parked = Arc::clone(&parked);
            let depths = Arc::clone(&depths);
            Task::builder()
                .stack_size(32 * 1024)
                .spawn(&executor, move || {
                    let value = Task::await_on(|handler| {
                        *parked[i].lock().unwrap() = Some(handler);
                    });
                    assert_eq!(value, i);
                    depths.lock().unwrap().push(context::nesting_depth());

                    // Relay the signal to the next task in the chain,
                    // synchronously from this body.
                    if i + 1 < TASKS {
                        let next = parked[i + 1].lock().unwrap().take().unwrap();
                        next.complete(i + 1);
                    }
                })
                .unwrap()
        })
        .collect();

    // Wait until every task has parked on its await, then seed the cascade.
    wait_for("all tasks parked", || {
        tasks.iter().all(|task| is_waiting(task))
    });
    parked[0].lock().unwrap().take().unwrap().complete(0);

    for task in &tasks {
        task.join();
    }

    let depths = depths.lock().unwrap();
    assert_eq!(depths.len(), TASKS);
    assert!(
        depths.iter().all(|&d| d <= context::MAX_NESTING_DEPTH),
        "nesting depth exceeded the cap: {depths:?}"
    );
}

#[test]
fn test_consecutive_yields_keep_the_same_identity() {
    let pool = pool();
    let ok = Arc::new(AtomicBool::new(false));

    let ok2 = Arc::clone(&ok);
    let task = Task::spawn(&pool.executor(), move || {
        let first = Task::current().unwrap().id();
        Task::yield_now();
        let second = Task::current().unwrap().id();
        Task::yield_now();
        let third = Task::current().unwrap().id();
        ok2.store(first == second && second == third, Ordering::SeqCst);
    })
    .unwrap();

    task.join();
    assert!(ok.load(Ordering::SeqCst));
}

#[test]
fn test_priority_defaults_and_inheritance() {
    let pool = pool();
    let executor = pool.executor();

    // Spawned outside a task: priority 0.
    let child_priority = Arc::new(AtomicI32::new(-1));
    let child_priority2 = Arc::clone(&child_priority);
    let executor2 = Arc::clone(&executor);
    let task = Task::spawn(&executor, move || {
        assert_eq!(Task::current_priority(), 0);

        // Spawned from inside: parent's priority plus 100.
        let child = Task::spawn(&executor2, || {}).unwrap();
        child_priority2.store(child.priority(), Ordering::SeqCst);
        child.join();
    })
    .unwrap();

    assert_eq!(task.priority(), 0);
    task.join();
    assert_eq!(child_priority.load(Ordering::SeqCst), 100);

    task.set_priority(7);
    assert_eq!(task.priority(), 7);
}

#[test]
fn test_current_priority_is_zero_off_task() {
    assert!(Task::current().is_none());
    assert_eq!(Task::current_priority(), 0);
}

#[test]
fn test_stack_pos_measures_depth_within_the_task() {
    let pool = pool();
    let ok = Arc::new(AtomicBool::new(false));

    let ok2 = Arc::clone(&ok);
    let task = Task::spawn(&pool.executor(), move || {
        let pos = Task::current().unwrap().stack_pos();
        ok2.store(pos > 0 && pos < DEFAULT_STACK_SIZE, Ordering::SeqCst);
    })
    .unwrap();

    task.join();
    assert!(ok.load(Ordering::SeqCst));
}

#[test]
fn test_dump_of_a_sleeping_task_leaves_it_sleeping() {
    let pool = pool();
    let out = Arc::new(StdMutex::new(None));

    let out2 = Arc::clone(&out);
    let task = Task::builder()
        .name("sleeper")
        .stack_size(64 * 1024)
        .spawn(&pool.executor(), move || {
            let _frame = DebugScope::new("sleeping for the dump test");
            *out2.lock().unwrap() = Some(Task::sleep(Duration::from_millis(500)));
        })
        .unwrap();

    wait_for("task to fall asleep", || is_waiting(&task));
    assert_eq!(
        task.debug_frames().lock().as_slice(),
        ["sleeping for the dump test".to_string()]
    );

    // Another test's `backtrace_all` can hold the request bit briefly, so
    // retry rather than demand the first attempt wins.
    wait_for("a successful dump", || task.try_dump_stack_trace());

    // The task went back to sleeping rather than terminating.
    assert!(!task.state.load().is_terminal());

    // The sleep still runs to its own deadline.
    task.join();
    assert_eq!(out.lock().unwrap().take(), Some(Ok(())));

    // A terminal task is not dump-eligible.
    assert!(!task.try_dump_stack_trace());
}

#[test]
fn test_dump_of_a_running_task_fails() {
    let pool = pool();
    let keep_busy = Arc::new(AtomicBool::new(true));

    let keep_busy2 = Arc::clone(&keep_busy);
    let task = Task::spawn(&pool.executor(), move || {
        while keep_busy2.load(Ordering::SeqCst) {
            Task::yield_now();
        }
    })
    .unwrap();

    // A task bouncing between running and ready is never dump-eligible.
    for _ in 0..64 {
        assert!(!task.try_dump_stack_trace());
    }

    keep_busy.store(false, Ordering::SeqCst);
    task.join();
}

#[test]
fn test_backtrace_all_counts_live_tasks() {
    let pool = pool();
    let task = Task::builder()
        .name("backtrace-target")
        .stack_size(64 * 1024)
        .spawn(&pool.executor(), || {
            let _ = Task::sleep(Duration::from_secs(3600));
        })
        .unwrap();

    wait_for("task to fall asleep", || is_waiting(&task));
    assert!(backtrace_all() >= 1);

    assert!(task.wake());
    task.join();
}

#[test]
fn test_pool_shutdown_waits_for_a_running_task() {
    let pool = pool();
    let finished = Arc::new(AtomicBool::new(false));

    let finished2 = Arc::clone(&finished);
    let task = Task::spawn(&pool.executor(), move || {
        let _ = Task::sleep(Duration::from_millis(100));
        finished2.store(true, Ordering::SeqCst);
    })
    .unwrap();
    drop(task);

    // The task's work guard keeps the pool from draining under it.
    drop(pool);
    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn test_builder_defaults() {
    let pool = pool();
    let task = Task::spawn(&pool.executor(), || {}).unwrap();
    assert_eq!(task.name(), "(anonymous)");
    assert!(task.id() >= 1);
    task.join();

    let named = Task::builder()
        .name("worker-task")
        .spawn(&pool.executor(), || {})
        .unwrap();
    assert_eq!(named.name(), "worker-task");
    assert!(named.id() > task.id());
    named.join();
}
