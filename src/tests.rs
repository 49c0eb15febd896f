//! Integration tests for the fiber-based task scheduler.

use crate::{
    AtomicFlag, EmptyQueueBehavior, Task, TaskCounter, TaskPriority, TaskScheduler,
    TaskSchedulerInitOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn options(threads: usize, behavior: EmptyQueueBehavior) -> TaskSchedulerInitOptions {
    TaskSchedulerInitOptions {
        thread_pool_size: threads,
        behavior,
        // Plenty for test bodies while keeping massive scenarios cheap.
        fiber_stack_size: 128 * 1024,
        ..Default::default()
    }
}

#[test]
fn single_job() {
    let scheduler = TaskScheduler::new();
    scheduler
        .init(options(4, EmptyQueueBehavior::Yield))
        .unwrap();

    let a = Arc::new(AtomicUsize::new(0));
    let event = AtomicFlag::new(true);

    let a_clone = a.clone();
    let event_clone = event.clone();
    scheduler.add_task(
        Task::new(move |ts| {
            a_clone.store(10, Ordering::SeqCst);
            event_clone.clear(ts);
        }),
        TaskPriority::Normal,
        None,
    );

    scheduler.wait_for_flag(&event, false);
    assert_eq!(a.load(Ordering::SeqCst), 10);
}

#[test]
fn job_with_deps() {
    let scheduler = TaskScheduler::new();
    scheduler
        .init(options(4, EmptyQueueBehavior::Yield))
        .unwrap();

    let a = Arc::new(AtomicUsize::new(0));
    let e1 = AtomicFlag::new(true);
    let e2 = AtomicFlag::new(true);

    let a1 = a.clone();
    let e1_signal = e1.clone();
    scheduler.add_task(
        Task::new(move |ts| {
            a1.store(10, Ordering::SeqCst);
            e1_signal.clear(ts);
        }),
        TaskPriority::Normal,
        None,
    );

    // The second task waits on the first from inside its own fiber.
    let a2 = a.clone();
    let e1_wait = e1.clone();
    let e2_signal = e2.clone();
    scheduler.add_task(
        Task::new(move |ts| {
            ts.wait_for_flag(&e1_wait, false);
            a2.fetch_add(10, Ordering::SeqCst);
            e2_signal.clear(ts);
        }),
        TaskPriority::Normal,
        None,
    );

    scheduler.wait_for_flag(&e2, false);
    assert_eq!(a.load(Ordering::SeqCst), 20);
}

#[test]
fn parallel_for() {
    let scheduler = TaskScheduler::new();
    scheduler
        .init(options(4, EmptyQueueBehavior::Yield))
        .unwrap();

    let a = Arc::new(AtomicUsize::new(0));
    let event = AtomicFlag::new(true);

    let a_outer = a.clone();
    let event_signal = event.clone();
    scheduler.add_task(
        Task::new(move |ts| {
            let counter = TaskCounter::new();
            let tasks: Vec<Task> = (0..100)
                .map(|_| {
                    let a = a_outer.clone();
                    Task::new(move |_| {
                        a.fetch_add(10, Ordering::SeqCst);
                    })
                })
                .collect();
            ts.add_tasks(tasks, TaskPriority::Normal, Some(&counter));
            ts.wait_for_counter(&counter, false);
            a_outer.fetch_add(10, Ordering::SeqCst);
            event_signal.clear(ts);
        }),
        TaskPriority::Normal,
        None,
    );

    scheduler.wait_for_flag(&event, false);
    assert_eq!(a.load(Ordering::SeqCst), 1010);
}

#[test]
fn parallel_for_massive() {
    let scheduler = TaskScheduler::new();
    scheduler
        .init(options(0, EmptyQueueBehavior::Yield))
        .unwrap();

    let a = Arc::new(AtomicUsize::new(0));
    let event = TaskCounter::new();
    event.add(10);

    for _ in 0..10 {
        let a_outer = a.clone();
        let event = event.clone();
        scheduler.add_task(
            Task::new(move |ts| {
                let counter = TaskCounter::new();
                let tasks: Vec<Task> = (0..1000)
                    .map(|_| {
                        let a = a_outer.clone();
                        Task::new(move |_| {
                            a.fetch_add(10, Ordering::SeqCst);
                        })
                    })
                    .collect();
                ts.add_tasks(tasks, TaskPriority::Normal, Some(&counter));
                ts.wait_for_counter(&counter, false);
                a_outer.fetch_add(10, Ordering::SeqCst);
                event.decrement(ts);
            }),
            TaskPriority::Normal,
            None,
        );
    }

    scheduler.wait_for_counter(&event, false);
    assert_eq!(a.load(Ordering::SeqCst), 100_100);
}

#[test]
fn massive_coroutine() {
    let _ = env_logger::builder().is_test(true).try_init();

    let scheduler = TaskScheduler::new();
    scheduler
        .init(options(0, EmptyQueueBehavior::Sleep))
        .unwrap();

    let a = Arc::new(AtomicUsize::new(0));
    let event = TaskCounter::new();
    event.add(1000);

    let outers: Vec<Task> = (0..1000)
        .map(|_| {
            let a_outer = a.clone();
            let event = event.clone();
            Task::new(move |ts| {
                let counter = TaskCounter::new();
                let tasks: Vec<Task> = (0..100)
                    .map(|_| {
                        let a = a_outer.clone();
                        Task::new(move |_| {
                            a.fetch_add(10, Ordering::SeqCst);
                        })
                    })
                    .collect();
                ts.add_tasks(tasks, TaskPriority::Normal, Some(&counter));
                ts.wait_for_counter(&counter, false);
                a_outer.fetch_add(10, Ordering::SeqCst);
                event.decrement(ts);
            })
        })
        .collect();
    scheduler.add_tasks(outers, TaskPriority::Normal, None);

    scheduler.wait_for_counter(&event, false);
    assert_eq!(a.load(Ordering::SeqCst), 1_010_000);
}

#[test]
fn pin_to_current() {
    let scheduler = TaskScheduler::new();
    scheduler
        .init(options(4, EmptyQueueBehavior::Yield))
        .unwrap();

    let done = AtomicFlag::new(true);
    let before = Arc::new(AtomicUsize::new(usize::MAX));
    let after = Arc::new(AtomicUsize::new(usize::MAX));

    let done_signal = done.clone();
    let before_clone = before.clone();
    let after_clone = after.clone();
    scheduler.add_task(
        Task::new(move |ts| {
            before_clone.store(ts.get_current_thread_index().unwrap(), Ordering::SeqCst);

            let counter = TaskCounter::new();
            ts.add_task(
                Task::new(|_| {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }),
                TaskPriority::Normal,
                Some(&counter),
            );
            ts.wait_for_counter(&counter, true);

            after_clone.store(ts.get_current_thread_index().unwrap(), Ordering::SeqCst);
            done_signal.clear(ts);
        }),
        TaskPriority::Normal,
        None,
    );

    scheduler.wait_for_flag(&done, false);
    let before = before.load(Ordering::SeqCst);
    let after = after.load(Ordering::SeqCst);
    assert_ne!(before, usize::MAX);
    assert_eq!(before, after, "pinned wait resumed on a different carrier");
}

#[test]
fn wait_returns_immediately_when_already_done() {
    let scheduler = TaskScheduler::new();
    scheduler
        .init(options(2, EmptyQueueBehavior::Yield))
        .unwrap();

    // Counter already at its target: the wait must not park.
    let counter = TaskCounter::new();
    scheduler.wait_for_counter(&counter, false);
}

#[test]
fn counter_round_trip_restores_value() {
    let scheduler = TaskScheduler::new();
    scheduler
        .init(options(2, EmptyQueueBehavior::Yield))
        .unwrap();

    let counter = TaskCounter::new();
    counter.add(5);
    for _ in 0..5 {
        counter.decrement(&scheduler);
    }
    assert_eq!(counter.load(), 0);
}

#[test]
fn double_init_is_rejected() {
    let scheduler = TaskScheduler::new();
    scheduler
        .init(options(2, EmptyQueueBehavior::Yield))
        .unwrap();

    let err = scheduler
        .init(options(2, EmptyQueueBehavior::Yield))
        .unwrap_err();
    assert_eq!(err.code(), -30);
}

#[test]
fn single_threaded_scheduler_runs_work_during_waits() {
    let scheduler = TaskScheduler::new();
    scheduler
        .init(options(1, EmptyQueueBehavior::Yield))
        .unwrap();

    // With one carrier, submitted tasks only run while the caller waits.
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = TaskCounter::new();
    for _ in 0..10 {
        let ran = ran.clone();
        scheduler.add_task(
            Task::new(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
            }),
            TaskPriority::Normal,
            Some(&counter),
        );
    }
    scheduler.wait_for_counter(&counter, false);
    assert_eq!(ran.load(Ordering::SeqCst), 10);
}

#[test]
fn workers_steal_from_the_submitting_thread() {
    let scheduler = TaskScheduler::new();
    scheduler
        .init(options(4, EmptyQueueBehavior::Yield))
        .unwrap();

    // Everything lands on worker 0's queue; the other carriers have nothing
    // of their own and must steal to participate.
    let seen = Arc::new(parking_lot::Mutex::new(std::collections::HashSet::new()));
    let counter = TaskCounter::new();
    for _ in 0..200 {
        let seen = seen.clone();
        scheduler.add_task(
            Task::new(move |ts| {
                seen.lock().insert(ts.get_current_thread_index().unwrap());
                std::thread::sleep(std::time::Duration::from_micros(50));
            }),
            TaskPriority::Normal,
            Some(&counter),
        );
    }
    scheduler.wait_for_counter(&counter, false);
    assert!(
        seen.lock().len() > 1,
        "no task ever executed on a stolen carrier"
    );
}

#[test]
fn high_priority_resumes_before_normal_backlog() {
    let scheduler = TaskScheduler::new();
    scheduler
        .init(options(2, EmptyQueueBehavior::Yield))
        .unwrap();

    // Not a strict ordering assertion (the system is concurrent); this just
    // drives both queues and the hi-pri unwrap path together.
    let a = Arc::new(AtomicUsize::new(0));
    let counter = TaskCounter::new();
    for _ in 0..50 {
        let a = a.clone();
        scheduler.add_task(
            Task::new(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            }),
            TaskPriority::Normal,
            Some(&counter),
        );
    }
    for _ in 0..50 {
        let a = a.clone();
        scheduler.add_task(
            Task::new(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            }),
            TaskPriority::High,
            Some(&counter),
        );
    }
    scheduler.wait_for_counter(&counter, false);
    assert_eq!(a.load(Ordering::SeqCst), 100);
}

#[test]
fn wait_for_predicate_reevaluates_until_true() {
    let scheduler = TaskScheduler::new();
    scheduler
        .init(options(4, EmptyQueueBehavior::Yield))
        .unwrap();

    let progress = Arc::new(AtomicUsize::new(0));
    let done = AtomicFlag::new(true);

    let progress_task = progress.clone();
    scheduler.add_task(
        Task::new(move |_| {
            for _ in 0..10 {
                progress_task.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_micros(200));
            }
        }),
        TaskPriority::Normal,
        None,
    );

    let progress_pred = progress.clone();
    let done_signal = done.clone();
    scheduler.add_task(
        Task::new(move |ts| {
            ts.wait_for_predicate(|| progress_pred.load(Ordering::SeqCst) >= 10, false);
            done_signal.clear(ts);
        }),
        TaskPriority::Normal,
        None,
    );

    scheduler.wait_for_flag(&done, false);
    assert!(progress.load(Ordering::SeqCst) >= 10);
}

#[test]
fn empty_queue_behavior_can_change_at_runtime() {
    let scheduler = TaskScheduler::new();
    scheduler
        .init(options(2, EmptyQueueBehavior::Sleep))
        .unwrap();

    scheduler.set_empty_queue_behavior(EmptyQueueBehavior::Yield);

    let counter = TaskCounter::new();
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = ran.clone();
    scheduler.add_task(
        Task::new(move |_| {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }),
        TaskPriority::Normal,
        Some(&counter),
    );
    scheduler.wait_for_counter(&counter, false);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn full_atomic_counter_waits_for_arbitrary_target() {
    let scheduler = TaskScheduler::new();
    scheduler
        .init(options(4, EmptyQueueBehavior::Yield))
        .unwrap();

    let target = crate::FullAtomicCounter::new(0);
    let done = AtomicFlag::new(true);

    let target_task = target.clone();
    scheduler.add_task(
        Task::new(move |ts| {
            for _ in 0..7 {
                target_task.add(1, ts);
            }
        }),
        TaskPriority::Normal,
        None,
    );

    let target_wait = target.clone();
    let done_signal = done.clone();
    scheduler.add_task(
        Task::new(move |ts| {
            ts.wait_for_counter_target(&target_wait, 7, false);
            done_signal.clear(ts);
        }),
        TaskPriority::Normal,
        None,
    );

    scheduler.wait_for_flag(&done, false);
    assert_eq!(target.load(), 7);
}

#[test]
fn main_thread_index_is_zero() {
    let scheduler = TaskScheduler::new();
    scheduler
        .init(options(2, EmptyQueueBehavior::Yield))
        .unwrap();
    assert_eq!(scheduler.get_current_thread_index(), Some(0));
    assert_eq!(scheduler.num_threads(), 2);
    assert_eq!(
        scheduler.get_current_fiber().unwrap(),
        scheduler.get_main_fiber()
    );
}
