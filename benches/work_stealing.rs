//! Work-stealing stress benchmark using criterion.
//!
//! All work is submitted from one thread with wildly uneven task sizes, so
//! useful parallelism depends entirely on the thieves.

use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use taskfiber::{
    EmptyQueueBehavior, Task, TaskCounter, TaskPriority, TaskScheduler, TaskSchedulerInitOptions,
};

fn fibonacci(n: u64) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.wrapping_add(b);
        a = b;
        b = next;
    }
    a
}

fn bench_imbalanced_load(c: &mut Criterion) {
    let scheduler = TaskScheduler::new();
    scheduler
        .init(TaskSchedulerInitOptions {
            thread_pool_size: num_cpus::get(),
            behavior: EmptyQueueBehavior::Spin,
            fiber_stack_size: 128 * 1024,
            ..Default::default()
        })
        .unwrap();

    c.bench_function("imbalanced_fibonacci_batch", |b| {
        let sink = Arc::new(AtomicU64::new(0));
        b.iter(|| {
            let counter = TaskCounter::new();
            let tasks: Vec<Task> = (0..512u64)
                .map(|i| {
                    let sink = sink.clone();
                    // Task cost varies by two orders of magnitude.
                    let n = if i % 17 == 0 { 20_000 } else { 200 };
                    Task::new(move |_| {
                        sink.fetch_add(fibonacci(n), Ordering::Relaxed);
                    })
                })
                .collect();
            scheduler.add_tasks(tasks, TaskPriority::Normal, Some(&counter));
            scheduler.wait_for_counter(&counter, false);
        });
    });
}

criterion_group!(benches, bench_imbalanced_load);
criterion_main!(benches);
