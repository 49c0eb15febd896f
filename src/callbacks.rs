//! Event callbacks for profiler and tracer integration.
//!
//! The scheduler reports lifecycle events through this trait so an external
//! tracer can follow threads and fibers without the core depending on it.
//! All methods default to no-ops; implementors override what they need and
//! install the handler through
//! [`TaskSchedulerInitOptions`](crate::TaskSchedulerInitOptions).

use crate::fiber::FiberId;

pub trait EventCallbacks: Send + Sync {
    /// All worker threads have been created; `num_threads` includes the
    /// caller's thread, which the scheduler reclaims as worker 0.
    fn on_threads_created(&self, _num_threads: usize) {}

    /// Called once at init for the main fiber. Fibers created later for
    /// dispatch are not individually announced.
    fn on_fibers_created(&self, _num_fibers: usize) {}

    fn on_worker_thread_started(&self, _thread_index: usize) {}

    fn on_worker_thread_ended(&self, _thread_index: usize) {}

    /// A carrier began executing `fiber`.
    fn on_fiber_attached(&self, _fiber: FiberId) {}

    /// A carrier stopped executing `fiber`. `is_waiting` is true when the
    /// fiber parked on a wait rather than returning to the pool.
    fn on_fiber_detached(&self, _fiber: FiberId, _is_waiting: bool) {}
}
