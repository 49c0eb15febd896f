//! Counter-based synchronization primitives.
//!
//! Counters are the synchronization mechanism of the scheduler: fibers park
//! on a counter until it reaches a target value, without ever blocking their
//! carrier thread. Three variants share one core:
//!
//! - [`TaskCounter`]: counts outstanding tasks; the target is always zero.
//! - [`AtomicFlag`]: binary event built on the same machinery.
//! - [`FullAtomicCounter`]: general-purpose value with caller-chosen targets.
//!
//! Handles are cheap clones over an `Arc`. Operations that can resume waiters
//! take the scheduler explicitly — the counter stores no back-pointer.

use crate::scheduler::TaskScheduler;
use crate::task::ReadyFiberRef;
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const NUM_WAITING_FIBER_SLOTS: usize = 4;

/// One reusable waiter slot.
///
/// Publication protocol: a wait-caller claims the slot by flipping its
/// `free` flag (in the parallel `free_slots` array), fills in the fields,
/// then publishes with `in_use = false`. A firing thread claims a published
/// slot by CASing `in_use` back to `true`, consumes the fields, and releases
/// the slot by restoring `free`. The plain fields are only accessed between
/// those release/acquire edges.
struct WaitingFiberSlot {
    in_use: AtomicBool,
    bundle: Cell<Option<ReadyFiberRef>>,
    target: Cell<usize>,
    pinned_thread: Cell<Option<usize>>,
}

impl WaitingFiberSlot {
    fn new() -> Self {
        WaitingFiberSlot {
            in_use: AtomicBool::new(true),
            bundle: Cell::new(None),
            target: Cell::new(0),
            pinned_thread: Cell::new(None),
        }
    }
}

/// Waiters that arrive while every fixed slot is occupied.
struct OverflowSlot {
    bundle: ReadyFiberRef,
    target: usize,
    pinned_thread: Option<usize>,
}

/// State shared by every counter variant.
pub(crate) struct CounterCore {
    value: AtomicUsize,
    /// Number of threads currently publishing waiter state (firing waiters
    /// after a value change). The wait fast path drains this before
    /// returning, so a wakeup never races a just-published waiter.
    lock: AtomicUsize,
    free_slots: [AtomicBool; NUM_WAITING_FIBER_SLOTS],
    slots: [WaitingFiberSlot; NUM_WAITING_FIBER_SLOTS],
    overflow: Mutex<Vec<OverflowSlot>>,
}

// SAFETY: the `Cell` fields of the slots are published and claimed through
// the acquire/release protocol documented on `WaitingFiberSlot`.
unsafe impl Send for CounterCore {}
unsafe impl Sync for CounterCore {}

impl CounterCore {
    fn new(initial: usize) -> Self {
        CounterCore {
            value: AtomicUsize::new(initial),
            lock: AtomicUsize::new(0),
            free_slots: [(); NUM_WAITING_FIBER_SLOTS].map(|()| AtomicBool::new(true)),
            slots: [(); NUM_WAITING_FIBER_SLOTS].map(|()| WaitingFiberSlot::new()),
            overflow: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn value_relaxed(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }

    pub(crate) fn publishers_in_flight(&self) -> bool {
        self.lock.load(Ordering::SeqCst) > 0
    }

    /// Installs a parked fiber waiting for the counter to equal `target`.
    ///
    /// Returns `true` if the counter already matched and the caller should
    /// not park: the bundle was never made visible (or was reclaimed before
    /// any firer saw it) and the caller still owns it. Returns `false` when
    /// the waiter is installed — from then on a firing thread owns
    /// republication, and the caller must park.
    pub(crate) fn add_fiber_to_waiting_list(
        &self,
        bundle: ReadyFiberRef,
        target: usize,
        pinned_thread: Option<usize>,
    ) -> bool {
        for i in 0..NUM_WAITING_FIBER_SLOTS {
            if self.free_slots[i]
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            // We own the slot; fill it in and publish.
            let slot = &self.slots[i];
            slot.bundle.set(Some(bundle));
            slot.target.set(target);
            slot.pinned_thread.set(pinned_thread);
            slot.in_use.store(false, Ordering::Release);

            // The waiter is now being tracked. Re-check the value in case it
            // moved while we were filling the slot in; without this a final
            // decrement could slip by unobserved and strand the fiber.
            let value = self.value.load(Ordering::Relaxed);
            if slot.in_use.load(Ordering::Acquire) {
                return false;
            }
            if target == value {
                if slot
                    .in_use
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    // A firing thread got there first and owns the bundle.
                    return false;
                }
                self.free_slots[i].store(true, Ordering::Release);
                return true;
            }
            return false;
        }

        // Every fixed slot is taken; spill into the overflow list.
        self.overflow.lock().push(OverflowSlot {
            bundle,
            target,
            pinned_thread,
        });

        let value = self.value.load(Ordering::Relaxed);
        if value == target {
            // Same re-check as above; reclaim our entry if no firer already
            // took it.
            let mut overflow = self.overflow.lock();
            if let Some(pos) = overflow.iter().position(|slot| slot.bundle == bundle) {
                overflow.remove(pos);
                return true;
            }
        }
        false
    }

    /// Resumes every waiter whose target equals `value`. Each waiter fires
    /// exactly once: the CAS on `in_use` (or removal from the overflow list)
    /// decides which thread owns the republication.
    fn check_waiting_fibers(&self, value: usize, scheduler: &TaskScheduler) {
        for i in 0..NUM_WAITING_FIBER_SLOTS {
            if self.free_slots[i].load(Ordering::Acquire) {
                continue;
            }
            let slot = &self.slots[i];
            if slot.in_use.load(Ordering::Acquire) {
                continue;
            }
            if slot.target.get() == value
                && slot
                    .in_use
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
            {
                let bundle = slot.bundle.take().expect("claimed slot without a bundle");
                let pinned_thread = slot.pinned_thread.get();
                scheduler.add_ready_fiber(pinned_thread, bundle);
                self.free_slots[i].store(true, Ordering::Release);
            }
        }

        let mut fired = Vec::new();
        {
            let mut overflow = self.overflow.lock();
            let mut i = 0;
            while i < overflow.len() {
                if overflow[i].target == value {
                    fired.push(overflow.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        // Republication happens outside the overflow lock; add_ready_fiber
        // takes queue and pinned-list locks of its own.
        for slot in fired {
            scheduler.add_ready_fiber(slot.pinned_thread, slot.bundle);
        }
    }

    /// Applies `change` to the value and fires matching waiters, counted as a
    /// publisher for the wait fast path's drain.
    fn update_and_check(
        &self,
        scheduler: &TaskScheduler,
        change: impl FnOnce(&AtomicUsize) -> usize,
    ) -> usize {
        self.lock.fetch_add(1, Ordering::SeqCst);
        let new_value = change(&self.value);
        self.check_waiting_fibers(new_value, scheduler);
        self.lock.fetch_sub(1, Ordering::SeqCst);
        new_value
    }
}

/// Tracks outstanding tasks; waiters resume when it reaches zero.
///
/// Submitting tasks with a counter attached calls [`TaskCounter::add`]
/// before the tasks are enqueued and the dispatch loop decrements after each
/// task body returns, so a waiter can never observe a premature zero.
///
/// # Example
///
/// ```no_run
/// use taskfiber::{Task, TaskCounter, TaskPriority, TaskScheduler, TaskSchedulerInitOptions};
///
/// let scheduler = TaskScheduler::new();
/// scheduler.init(TaskSchedulerInitOptions::default()).unwrap();
///
/// let counter = TaskCounter::new();
/// scheduler.add_task(Task::new(|_| {}), TaskPriority::Normal, Some(&counter));
/// scheduler.wait_for_counter(&counter, false);
/// ```
#[derive(Clone)]
pub struct TaskCounter {
    core: Arc<CounterCore>,
}

impl TaskCounter {
    pub fn new() -> Self {
        TaskCounter {
            core: Arc::new(CounterCore::new(0)),
        }
    }

    /// Adds `n` outstanding tasks. Never resumes waiters, so no scheduler
    /// reference is needed.
    pub fn add(&self, n: usize) {
        self.core.value.fetch_add(n, Ordering::SeqCst);
    }

    /// Marks one task complete, resuming waiters if the counter hits zero.
    pub fn decrement(&self, scheduler: &TaskScheduler) {
        self.core.update_and_check(scheduler, |value| {
            let prev = value.fetch_sub(1, Ordering::SeqCst);
            debug_assert!(prev > 0, "TaskCounter decremented below zero");
            prev - 1
        });
    }

    pub fn load(&self) -> usize {
        self.core.value.load(Ordering::SeqCst)
    }

    pub(crate) fn core(&self) -> &CounterCore {
        &self.core
    }
}

impl Default for TaskCounter {
    fn default() -> Self {
        TaskCounter::new()
    }
}

/// Binary event. A set flag holds waiters; clearing it releases them.
#[derive(Clone)]
pub struct AtomicFlag {
    core: Arc<CounterCore>,
}

impl AtomicFlag {
    /// Creates a flag. `set = true` starts it raised, which is the usual
    /// shape for an event that a task will later signal by clearing.
    pub fn new(set: bool) -> Self {
        AtomicFlag {
            core: Arc::new(CounterCore::new(usize::from(set))),
        }
    }

    /// Raises the flag. Raising never matches the wait target, so waiters
    /// are unaffected.
    pub fn set(&self) {
        self.core.value.store(1, Ordering::SeqCst);
    }

    /// Clears the flag, resuming every fiber waiting on it.
    pub fn clear(&self, scheduler: &TaskScheduler) {
        self.core.update_and_check(scheduler, |value| {
            value.store(0, Ordering::SeqCst);
            0
        });
    }

    pub fn is_set(&self) -> bool {
        self.core.value.load(Ordering::SeqCst) != 0
    }

    pub(crate) fn core(&self) -> &CounterCore {
        &self.core
    }
}

/// General-purpose atomic counter; waiters name their own target value.
///
/// Every mutating operation may satisfy a waiter, so each takes the
/// scheduler.
#[derive(Clone)]
pub struct FullAtomicCounter {
    core: Arc<CounterCore>,
}

impl FullAtomicCounter {
    pub fn new(initial: usize) -> Self {
        FullAtomicCounter {
            core: Arc::new(CounterCore::new(initial)),
        }
    }

    pub fn load(&self) -> usize {
        self.core.value.load(Ordering::SeqCst)
    }

    pub fn store(&self, value: usize, scheduler: &TaskScheduler) {
        self.core.update_and_check(scheduler, |v| {
            v.store(value, Ordering::SeqCst);
            value
        });
    }

    pub fn add(&self, n: usize, scheduler: &TaskScheduler) {
        self.core
            .update_and_check(scheduler, |v| v.fetch_add(n, Ordering::SeqCst) + n);
    }

    pub fn subtract(&self, n: usize, scheduler: &TaskScheduler) {
        self.core
            .update_and_check(scheduler, |v| v.fetch_sub(n, Ordering::SeqCst) - n);
    }

    pub(crate) fn core(&self) -> &CounterCore {
        &self.core
    }
}
