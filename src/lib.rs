//! # taskfiber - Fiber-Based Task Scheduler
//!
//! A task scheduler for parallel game-engine-style workloads: many small
//! tasks executed on a fixed pool of worker threads, with the ability for
//! tasks to *wait* on synchronization counters without blocking their
//! carrier thread. Waits switch the underlying user-space stack (fiber)
//! instead of suspending the OS thread, so millions of lightweight in-flight
//! coroutines cost little more than their stacks.
//!
//! ## Architecture
//!
//! - **Fibers**: cooperatively switched execution contexts (via
//!   `corosensei`); the dispatch loop itself runs inside fibers.
//! - **Work-stealing deques**: per-worker hi/lo priority queues; the owner
//!   pushes and pops LIFO, idle workers steal FIFO from peers.
//! - **Counters**: atomic values with waiter lists; fibers park on a counter
//!   and are republished to the scheduler when it reaches their target.
//! - **Carriers**: OS worker threads, including the caller's thread, which
//!   is reclaimed as worker 0.
//!
//! ## Example
//!
//! ```no_run
//! use taskfiber::{Task, TaskCounter, TaskPriority, TaskScheduler, TaskSchedulerInitOptions};
//!
//! let scheduler = TaskScheduler::new();
//! scheduler.init(TaskSchedulerInitOptions::default()).unwrap();
//!
//! let counter = TaskCounter::new();
//! scheduler.add_task(
//!     Task::new(|_| println!("hello from a fiber task")),
//!     TaskPriority::Normal,
//!     Some(&counter),
//! );
//! scheduler.wait_for_counter(&counter, false);
//! ```

pub mod callbacks;
pub mod counter;
mod deque;
pub mod fiber;
pub mod scheduler;
pub mod task;

pub use callbacks::EventCallbacks;
pub use counter::{AtomicFlag, FullAtomicCounter, TaskCounter};
pub use fiber::FiberId;
pub use scheduler::{EmptyQueueBehavior, SchedulerError, TaskScheduler, TaskSchedulerInitOptions};
pub use task::{Task, TaskPriority};

#[cfg(test)]
mod tests;
