//! Task definitions and the items that flow through worker queues.
//!
//! A [`Task`] is a unit of work submitted to the scheduler. Internally the
//! queues carry [`DispatchItem`]s: either a real task bundled with its
//! completion counter, or a *ready fiber* — a previously parked fiber whose
//! wait condition has been satisfied and which should be resumed instead of
//! running new work.

use crate::counter::TaskCounter;
use crate::fiber::FiberHandle;
use crate::scheduler::TaskScheduler;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Priority of a submitted task. High-priority work is dispatched before
/// normal-priority work, and resumed fibers always go through the
/// high-priority path.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskPriority {
    High,
    Normal,
}

/// A unit of work to be executed by the scheduler.
///
/// The closure receives a reference to the scheduler so it can submit nested
/// tasks, wait on counters, or query its carrier thread.
pub struct Task {
    func: Box<dyn FnOnce(&TaskScheduler) + Send + 'static>,
}

impl Task {
    /// Creates a new task from the given closure.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use taskfiber::Task;
    ///
    /// let task = Task::new(|scheduler| {
    ///     println!("running on worker {:?}", scheduler.get_current_thread_index());
    /// });
    /// ```
    pub fn new<F>(func: F) -> Task
    where
        F: FnOnce(&TaskScheduler) + Send + 'static,
    {
        Task {
            func: Box::new(func),
        }
    }

    pub(crate) fn run(self, scheduler: &TaskScheduler) {
        (self.func)(scheduler);
    }
}

/// A task plus the bookkeeping it was submitted with.
pub(crate) struct TaskBundle {
    pub(crate) task: Task,
    /// Decremented by the dispatch loop after the task body returns.
    pub(crate) counter: Option<TaskCounter>,
    /// Debug label, surfaced through trace logging.
    pub(crate) name: Option<&'static str>,
}

/// The unit stored in the worker deques.
pub(crate) enum DispatchItem {
    Task(TaskBundle),
    ReadyFiber(ReadyFiberRef),
}

impl DispatchItem {
    /// Whether a popped item may be acted on right now. Real tasks always
    /// are; a ready fiber only once its parking thread has completed the
    /// switch away from it, and only after its spin budget is exhausted.
    pub(crate) fn is_ready(&self) -> bool {
        match self {
            DispatchItem::Task(_) => true,
            // SAFETY: the item holds ownership of the bundle.
            DispatchItem::ReadyFiber(bundle) => unsafe { bundle.as_ref().is_ready() },
        }
    }
}

/// Handshake record for a parked fiber.
///
/// Created when a fiber parks; listed in a counter's waiter slots, then
/// republished into a queue or pinned list once the wait is satisfied. The
/// carrier that resumes the fiber frees the bundle, or the parking thread
/// does if the wait turned out to be already satisfied.
pub(crate) struct ReadyFiberBundle {
    pub(crate) fiber: FiberHandle,
    /// Set (through the TLS stored-flag pointer) by the fiber that replaces
    /// the parked one on its carrier. Until then the parked fiber's stack is
    /// still in use and it must not be resumed anywhere.
    pub(crate) fiber_is_switched: AtomicBool,
    /// Number of times a would-be resumer passes over this bundle before
    /// taking it, counted down by readiness checks. Zero for counter waits;
    /// predicate waits use a larger budget so the re-enqueued fiber is not
    /// the immediate next pick.
    pub(crate) spin_count: AtomicI32,
}

impl ReadyFiberBundle {
    pub(crate) fn allocate(fiber: FiberHandle, spin_count: i32) -> ReadyFiberRef {
        ReadyFiberRef(Box::into_raw(Box::new(ReadyFiberBundle {
            fiber,
            fiber_is_switched: AtomicBool::new(false),
            spin_count: AtomicI32::new(spin_count),
        })))
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.fiber_is_switched.load(Ordering::Acquire)
            && self.spin_count.fetch_sub(1, Ordering::Relaxed) <= 0
    }
}

/// Owning pointer to a heap-allocated [`ReadyFiberBundle`].
///
/// Copies of the pointer travel through counter slots and queues; exactly one
/// holder releases it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ReadyFiberRef(*mut ReadyFiberBundle);

unsafe impl Send for ReadyFiberRef {}
unsafe impl Sync for ReadyFiberRef {}

impl ReadyFiberRef {
    /// # Safety
    ///
    /// The bundle must not have been released.
    pub(crate) unsafe fn as_ref<'a>(self) -> &'a ReadyFiberBundle {
        &*self.0
    }

    /// Pointer to the switched flag, stored in TLS for the stale-fiber
    /// handshake. Valid until the bundle is released.
    pub(crate) fn switched_flag(self) -> *const AtomicBool {
        // SAFETY: field projection only; the caller guarantees liveness when
        // dereferencing the returned pointer.
        unsafe { &(*self.0).fiber_is_switched as *const AtomicBool }
    }

    /// Takes the parked fiber out of the bundle and frees the bundle.
    ///
    /// # Safety
    ///
    /// The caller must be the sole remaining holder of the bundle.
    pub(crate) unsafe fn take_fiber(self) -> FiberHandle {
        let bundle = Box::from_raw(self.0);
        bundle.fiber
    }

    /// Frees the bundle without touching the fiber. Used when a wait
    /// completed before the fiber ever parked.
    ///
    /// # Safety
    ///
    /// The caller must be the sole remaining holder of the bundle.
    pub(crate) unsafe fn release(self) {
        drop(Box::from_raw(self.0));
    }
}
