//! The task scheduler: worker lifecycle, dispatch loop, stealing, and waits.
//!
//! The scheduler owns a fixed pool of carrier threads. Each carrier runs one
//! fiber at a time; the dispatch loop itself executes inside fibers so that a
//! task can park mid-execution (waiting on a counter) by switching stacks,
//! leaving the carrier free to keep dispatching. The caller's thread is
//! reclaimed as worker 0 and participates in dispatch whenever it waits.

use crate::callbacks::EventCallbacks;
use crate::counter::{AtomicFlag, CounterCore, FullAtomicCounter, TaskCounter};
use crate::deque::{Steal, WaitFreeQueue};
use crate::fiber::{Fiber, FiberEvent, FiberHandle, FiberId, SendPtr};
use crate::task::{DispatchItem, ReadyFiberBundle, ReadyFiberRef, Task, TaskBundle, TaskPriority};
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, UnsafeCell};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// How often a carrier must come up empty before the empty-queue policy
/// (yield or sleep) kicks in.
const FAILED_POP_ATTEMPTS_HEURISTIC: u32 = 25;

/// OS stack size for worker threads. Fibers get their own stacks; the worker
/// stack only hosts the carrier pump and thread bookkeeping.
const WORKER_THREAD_STACK_SIZE: usize = 512 * 1024;

const DEFAULT_FIBER_STACK_SIZE: usize = 512 * 1024;
const DEFAULT_PREDICATE_SPIN_COUNT: i32 = 15;

/// What a carrier does when it finds no work.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EmptyQueueBehavior {
    /// Loop without any OS interaction.
    Spin = 0,
    /// Yield the OS thread after repeated failed pops.
    Yield = 1,
    /// Park the OS thread on a condition variable after repeated failed
    /// pops; producers wake sleepers as work arrives.
    Sleep = 2,
}

impl EmptyQueueBehavior {
    fn from_u8(value: u8) -> EmptyQueueBehavior {
        match value {
            0 => EmptyQueueBehavior::Spin,
            1 => EmptyQueueBehavior::Yield,
            _ => EmptyQueueBehavior::Sleep,
        }
    }
}

/// Errors surfaced by [`TaskScheduler::init`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task scheduler is already initialized")]
    AlreadyInitialized,
    #[error("failed to create worker thread {index}")]
    WorkerThreadCreation {
        index: usize,
        #[source]
        source: io::Error,
    },
}

impl SchedulerError {
    /// Numeric code, for callers bridging to C-style status returns.
    pub fn code(&self) -> i32 {
        match self {
            SchedulerError::AlreadyInitialized => -30,
            SchedulerError::WorkerThreadCreation { .. } => -60,
        }
    }
}

/// Options for [`TaskScheduler::init`].
pub struct TaskSchedulerInitOptions {
    /// Number of worker threads, including the caller's. `0` means one per
    /// logical processor.
    pub thread_pool_size: usize,
    /// Pin worker `i` to core `i % hardware_concurrency`.
    pub set_affinity: bool,
    pub behavior: EmptyQueueBehavior,
    /// Stack size for dispatch fibers.
    pub fiber_stack_size: usize,
    /// Spin budget for fibers re-enqueued by
    /// [`TaskScheduler::wait_for_predicate`]: how many would-be resumers
    /// pass over the fiber before it may be picked up again, forcing other
    /// work to make progress first.
    pub predicate_spin_count: i32,
    pub callbacks: Option<Arc<dyn EventCallbacks>>,
}

impl Default for TaskSchedulerInitOptions {
    fn default() -> Self {
        TaskSchedulerInitOptions {
            thread_pool_size: 0,
            set_affinity: false,
            behavior: EmptyQueueBehavior::Spin,
            fiber_stack_size: DEFAULT_FIBER_STACK_SIZE,
            predicate_spin_count: DEFAULT_PREDICATE_SPIN_COUNT,
            callbacks: None,
        }
    }
}

/// Where the previous fiber on this carrier should go once the switch away
/// from it has completed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FiberDestination {
    None,
    ToPool,
    ToWaiting,
}

/// Per-worker storage. The first group of fields is only touched by the
/// owning carrier; the queues and the pinned list are shared.
struct ThreadLocalStorage {
    current_fiber: Cell<FiberHandle>,
    old_fiber: Cell<FiberHandle>,
    old_fiber_destination: Cell<FiberDestination>,
    /// Points at the `fiber_is_switched` flag of the bundle the old fiber
    /// parked with. Only meaningful while the destination is `ToWaiting`.
    old_fiber_stored_flag: Cell<*const AtomicBool>,
    /// Stand-in for this OS thread's own call stack. For worker 0 this is
    /// the main fiber.
    thread_root: FiberHandle,
    failed_queue_pop_attempts: Cell<u32>,
    hi_pri_last_successful_steal: Cell<usize>,
    lo_pri_last_successful_steal: Cell<usize>,

    hi_pri_task_queue: WaitFreeQueue<DispatchItem>,
    lo_pri_task_queue: WaitFreeQueue<DispatchItem>,
    /// Ready fibers that must resume on this carrier specifically.
    pinned_ready_fibers: Mutex<Vec<ReadyFiberRef>>,
}

// SAFETY: the `Cell` fields are only accessed by the carrier the entry
// belongs to; cross-thread access goes through the queues and the pinned
// list, which synchronize internally.
unsafe impl Sync for ThreadLocalStorage {}

impl ThreadLocalStorage {
    fn new(thread_root: FiberHandle) -> Self {
        ThreadLocalStorage {
            current_fiber: Cell::new(FiberHandle::null()),
            old_fiber: Cell::new(FiberHandle::null()),
            old_fiber_destination: Cell::new(FiberDestination::None),
            old_fiber_stored_flag: Cell::new(std::ptr::null()),
            thread_root,
            failed_queue_pop_attempts: Cell::new(0),
            hi_pri_last_successful_steal: Cell::new(0),
            lo_pri_last_successful_steal: Cell::new(0),
            hi_pri_task_queue: WaitFreeQueue::new(),
            lo_pri_task_queue: WaitFreeQueue::new(),
            pinned_ready_fibers: Mutex::new(Vec::new()),
        }
    }
}

thread_local! {
    /// Index of the scheduler worker running on this OS thread, if any.
    static THREAD_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// The fiber-based task scheduler.
///
/// Construct with [`TaskScheduler::new`], then call
/// [`init`](TaskScheduler::init) once. Dropping the scheduler shuts the
/// worker pool down cooperatively; it must be dropped on the thread that
/// initialized it.
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
/// for _ in 0..100 {
///     scheduler.add_task(
///         Task::new(|_| { /* work */ }),
///         TaskPriority::Normal,
///         Some(&counter),
///     );
/// }
/// scheduler.wait_for_counter(&counter, false);
/// ```
pub struct TaskScheduler {
    num_threads: Cell<usize>,
    threads: UnsafeCell<Vec<thread::JoinHandle<()>>>,
    tls: UnsafeCell<Vec<CachePadded<ThreadLocalStorage>>>,
    main_fiber: Cell<FiberHandle>,
    quit_fibers: UnsafeCell<Vec<FiberHandle>>,
    initialized: AtomicBool,
    quit: AtomicBool,
    quit_count: AtomicUsize,
    empty_queue_behavior: AtomicU8,
    fiber_stack_size: Cell<usize>,
    predicate_spin_count: Cell<i32>,
    callbacks: UnsafeCell<Option<Arc<dyn EventCallbacks>>>,
    thread_sleep_lock: Mutex<()>,
    thread_sleep_cv: Condvar,
}

// SAFETY: the `Cell` and `UnsafeCell` fields are written during `init`
// (before `initialized` is published with release ordering, which every
// worker acquires before touching them) and during `Drop` (after all workers
// have been joined). In between, access is read-only or internally
// synchronized.
unsafe impl Send for TaskScheduler {}
unsafe impl Sync for TaskScheduler {}

impl TaskScheduler {
    /// Creates an uninitialized scheduler. The box keeps the scheduler's
    /// address stable, which worker threads and fibers rely on.
    pub fn new() -> Box<TaskScheduler> {
        Box::new(TaskScheduler {
            num_threads: Cell::new(0),
            threads: UnsafeCell::new(Vec::new()),
            tls: UnsafeCell::new(Vec::new()),
            main_fiber: Cell::new(FiberHandle::null()),
            quit_fibers: UnsafeCell::new(Vec::new()),
            initialized: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            quit_count: AtomicUsize::new(0),
            empty_queue_behavior: AtomicU8::new(EmptyQueueBehavior::Spin as u8),
            fiber_stack_size: Cell::new(DEFAULT_FIBER_STACK_SIZE),
            predicate_spin_count: Cell::new(DEFAULT_PREDICATE_SPIN_COUNT),
            callbacks: UnsafeCell::new(None),
            thread_sleep_lock: Mutex::new(()),
            thread_sleep_cv: Condvar::new(),
        })
    }

    /// Starts the worker pool, reclaiming the calling thread as worker 0.
    ///
    /// Fails with [`SchedulerError::AlreadyInitialized`] on a second call and
    /// [`SchedulerError::WorkerThreadCreation`] if an OS thread cannot be
    /// spawned (in which case already-spawned workers are shut down before
    /// returning).
    pub fn init(&self, options: TaskSchedulerInitOptions) -> Result<(), SchedulerError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyInitialized);
        }

        self.empty_queue_behavior
            .store(options.behavior as u8, Ordering::Relaxed);
        self.fiber_stack_size.set(options.fiber_stack_size);
        self.predicate_spin_count.set(options.predicate_spin_count);
        // SAFETY: no worker exists yet; nothing else can observe these.
        unsafe {
            *self.callbacks.get() = options.callbacks;
        }

        let num_threads = if options.thread_pool_size == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            options.thread_pool_size
        };
        self.num_threads.set(num_threads);

        let mut tls = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let root = FiberHandle(Box::into_raw(Fiber::thread_root()));
            tls.push(CachePadded::new(ThreadLocalStorage::new(root)));
        }
        // SAFETY: workers spin on `initialized` before reading the TLS array.
        unsafe {
            *self.tls.get() = tls;
        }

        if let Some(callbacks) = self.callbacks() {
            callbacks.on_threads_created(num_threads);
            callbacks.on_fibers_created(1);
        }

        let core_ids = if options.set_affinity {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        // The caller becomes worker 0; its own stack is the main fiber.
        THREAD_INDEX.with(|index| index.set(Some(0)));
        if let Some(&core) = core_ids.first() {
            core_affinity::set_for_current(core);
        }
        let main_fiber = self.tls(0).thread_root;
        self.main_fiber.set(main_fiber);
        self.tls(0).current_fiber.set(main_fiber);

        for i in 1..num_threads {
            let scheduler = SendPtr(self as *const TaskScheduler);
            let core = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[i % core_ids.len()])
            };
            let spawned = thread::Builder::new()
                .name(format!("taskfiber-worker-{i}"))
                .stack_size(WORKER_THREAD_STACK_SIZE)
                .spawn(move || {
                    // Force capture of the whole `SendPtr` (not just its
                    // `.0` field) so the closure stays `Send`.
                    let scheduler = scheduler;
                    // SAFETY: the scheduler outlives its workers; `Drop` (and
                    // the init failure path below) join them before the
                    // scheduler's memory is released.
                    let scheduler = unsafe { &*scheduler.0 };
                    scheduler.worker_thread_proc(i, core);
                });
            match spawned {
                Ok(handle) => {
                    // SAFETY: only init touches the thread list until all
                    // workers are running.
                    unsafe { (*self.threads.get()).push(handle) };
                }
                Err(source) => {
                    // Release the workers spun up so far: they are parked on
                    // the init spin-wait, which also watches `quit`.
                    self.quit.store(true, Ordering::Release);
                    // SAFETY: as above.
                    for handle in unsafe { (*self.threads.get()).drain(..) } {
                        let _ = handle.join();
                    }
                    log::error!("failed to create worker thread {i}: {source}");
                    return Err(SchedulerError::WorkerThreadCreation { index: i, source });
                }
            }
        }

        if let Some(callbacks) = self.callbacks() {
            callbacks.on_fiber_attached(main_fiber.id());
        }

        self.initialized.store(true, Ordering::Release);
        log::debug!("task scheduler initialized with {num_threads} worker threads");
        Ok(())
    }

    /// Submits a task. If a counter is supplied it is incremented before the
    /// task is enqueued, so waiters cannot observe a premature zero.
    pub fn add_task(&self, task: Task, priority: TaskPriority, counter: Option<&TaskCounter>) {
        self.add_task_named(None, task, priority, counter);
    }

    /// [`add_task`](TaskScheduler::add_task) with a debug label that shows up
    /// in trace logging.
    pub fn add_task_named(
        &self,
        name: Option<&'static str>,
        task: Task,
        priority: TaskPriority,
        counter: Option<&TaskCounter>,
    ) {
        debug_assert!(
            self.initialized.load(Ordering::Acquire),
            "add_task called before init"
        );
        let counter = counter.cloned();
        if let Some(counter) = &counter {
            counter.add(1);
        }

        let tls = self.tls(self.current_thread_index_or_zero());
        let bundle = TaskBundle {
            task,
            counter,
            name,
        };
        let queue = match priority {
            TaskPriority::High => &tls.hi_pri_task_queue,
            TaskPriority::Normal => &tls.lo_pri_task_queue,
        };
        // SAFETY: submissions come from the worker that owns this queue.
        // Calls from threads outside the pool fall back to queue 0, which is
        // owned by the (initializing) caller thread.
        unsafe { queue.push(DispatchItem::Task(bundle)) };

        if self.behavior() == EmptyQueueBehavior::Sleep {
            self.thread_sleep_cv.notify_one();
        }
    }

    /// Submits a batch of tasks under one counter increment.
    pub fn add_tasks(
        &self,
        tasks: Vec<Task>,
        priority: TaskPriority,
        counter: Option<&TaskCounter>,
    ) {
        debug_assert!(
            self.initialized.load(Ordering::Acquire),
            "add_tasks called before init"
        );
        let counter = counter.cloned();
        if let Some(counter) = &counter {
            counter.add(tasks.len());
        }

        let tls = self.tls(self.current_thread_index_or_zero());
        let queue = match priority {
            TaskPriority::High => &tls.hi_pri_task_queue,
            TaskPriority::Normal => &tls.lo_pri_task_queue,
        };
        for task in tasks {
            let bundle = TaskBundle {
                task,
                counter: counter.clone(),
                name: None,
            };
            // SAFETY: as in add_task.
            unsafe { queue.push(DispatchItem::Task(bundle)) };
        }

        if self.behavior() == EmptyQueueBehavior::Sleep {
            self.thread_sleep_cv.notify_all();
        }
    }

    /// Parks the current fiber until `counter` reaches zero.
    ///
    /// With `pin_to_current_thread` the fiber resumes on the same carrier it
    /// parked on, which lets callers hold thread-local resources across the
    /// wait. The main fiber is always pinned: only worker 0 can switch back
    /// to it.
    pub fn wait_for_counter(&self, counter: &TaskCounter, pin_to_current_thread: bool) {
        self.wait_for_counter_internal(counter.core(), 0, pin_to_current_thread);
    }

    /// Parks the current fiber until `flag` is cleared.
    pub fn wait_for_flag(&self, flag: &AtomicFlag, pin_to_current_thread: bool) {
        self.wait_for_counter_internal(flag.core(), 0, pin_to_current_thread);
    }

    /// Parks the current fiber until `counter` equals `value`.
    pub fn wait_for_counter_target(
        &self,
        counter: &FullAtomicCounter,
        value: usize,
        pin_to_current_thread: bool,
    ) {
        self.wait_for_counter_internal(counter.core(), value, pin_to_current_thread);
    }

    fn wait_for_counter_internal(
        &self,
        counter: &CounterCore,
        value: usize,
        pin_to_current_thread: bool,
    ) {
        // Fast out. Drain in-flight publishers before returning so we do not
        // race a waiter that is being readied right now.
        if counter.value_relaxed() == value {
            while counter.publishers_in_flight() {
                std::hint::spin_loop();
            }
            return;
        }

        let thread_index = self.current_thread_index();
        let tls = self.tls(thread_index);
        let current_fiber = tls.current_fiber.get();

        let pinned_thread = if pin_to_current_thread || current_fiber == self.main_fiber.get() {
            Some(thread_index)
        } else {
            None
        };

        let bundle = ReadyFiberBundle::allocate(current_fiber, 0);
        if counter.add_fiber_to_waiting_list(bundle, value, pinned_thread) {
            // The counter finished while we were installing the waiter; we
            // never parked and still own the bundle.
            // SAFETY: the bundle was never published.
            unsafe { bundle.release() };
            return;
        }

        // Park: hand this stack over through the stale-fiber handshake and
        // keep dispatching on a fresh fiber.
        let free_fiber = self.get_next_free_fiber();
        tls.old_fiber.set(current_fiber);
        tls.current_fiber.set(free_fiber);
        tls.old_fiber_destination.set(FiberDestination::ToWaiting);
        tls.old_fiber_stored_flag.set(bundle.switched_flag());

        if let Some(callbacks) = self.callbacks() {
            callbacks.on_fiber_detached(current_fiber.id(), true);
        }

        self.switch_fibers(current_fiber, free_fiber);

        // And we're back: the wait is satisfied.
        if let Some(callbacks) = self.callbacks() {
            callbacks.on_fiber_attached(self.current_fiber_handle().id());
        }
        self.clean_up_old_fiber();
    }

    /// Re-parks the current fiber until `pred` returns true.
    ///
    /// Unlike a counter wait there is no waiter list: the fiber re-enqueues
    /// itself as a ready fiber before every switch, with a spin budget
    /// (`predicate_spin_count`) that keeps it from being the immediate next
    /// pick, and re-evaluates the predicate each time it is resumed.
    pub fn wait_for_predicate<F>(&self, pred: F, pin_to_current_thread: bool)
    where
        F: Fn() -> bool,
    {
        let spin_count = self.predicate_spin_count.get();
        let mut tls = self.tls(self.current_thread_index());
        while !pred() {
            let current_fiber = tls.current_fiber.get();
            let pinned_thread =
                if pin_to_current_thread || current_fiber == self.main_fiber.get() {
                    Some(self.current_thread_index())
                } else {
                    None
                };

            let bundle = ReadyFiberBundle::allocate(current_fiber, spin_count);
            let free_fiber = self.get_next_free_fiber();

            self.add_ready_fiber(pinned_thread, bundle);

            tls.old_fiber.set(current_fiber);
            tls.current_fiber.set(free_fiber);
            tls.old_fiber_destination.set(FiberDestination::ToWaiting);
            tls.old_fiber_stored_flag.set(bundle.switched_flag());

            if let Some(callbacks) = self.callbacks() {
                callbacks.on_fiber_detached(current_fiber.id(), true);
            }

            self.switch_fibers(current_fiber, free_fiber);

            if let Some(callbacks) = self.callbacks() {
                callbacks.on_fiber_attached(self.current_fiber_handle().id());
            }
            self.clean_up_old_fiber();
            tls = self.tls(self.current_thread_index());
        }
    }

    /// Index of the scheduler worker running on the calling thread, or
    /// `None` if the thread is not part of the pool.
    pub fn get_current_thread_index(&self) -> Option<usize> {
        THREAD_INDEX.with(|index| index.get())
    }

    /// Identity of the fiber the calling carrier is executing.
    pub fn get_current_fiber(&self) -> Option<FiberId> {
        self.get_current_thread_index()
            .map(|index| self.tls(index).current_fiber.get().id())
    }

    /// Identity of the main fiber (worker 0's own stack).
    pub fn get_main_fiber(&self) -> FiberId {
        self.main_fiber.get().id()
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads.get()
    }

    /// Changes the empty-queue policy at runtime. When leaving `Sleep`, any
    /// parked carriers are woken so they observe the new policy.
    pub fn set_empty_queue_behavior(&self, behavior: EmptyQueueBehavior) {
        let previous = self.behavior();
        self.empty_queue_behavior
            .store(behavior as u8, Ordering::Relaxed);
        if previous == EmptyQueueBehavior::Sleep {
            let _guard = self.thread_sleep_lock.lock();
            self.thread_sleep_cv.notify_all();
        }
    }

    // ---- carrier internals ----------------------------------------------

    fn worker_thread_proc(&self, index: usize, core: Option<core_affinity::CoreId>) {
        if let Some(core) = core {
            core_affinity::set_for_current(core);
        }
        THREAD_INDEX.with(|slot| slot.set(Some(index)));

        // Spin until init has published the shared state. `quit` gets us out
        // if init fails partway through spawning the pool.
        while !self.initialized.load(Ordering::Acquire) {
            if self.quit.load(Ordering::Acquire) {
                return;
            }
            std::hint::spin_loop();
        }

        if let Some(callbacks) = self.callbacks() {
            callbacks.on_worker_thread_started(index);
        }

        let free_fiber = self.get_next_free_fiber();
        self.tls(index).current_fiber.set(free_fiber);
        self.pump(free_fiber);

        // The quit fiber switched back to this thread's root context.
        if let Some(callbacks) = self.callbacks() {
            callbacks.on_worker_thread_ended(index);
        }
        log::trace!("worker thread {index} ended");
    }

    /// Runs fibers on the calling OS thread until one of them switches to
    /// the thread's root context.
    fn pump(&self, first: FiberHandle) {
        let mut handle = first;
        loop {
            // SAFETY: this carrier holds the only live reference to the
            // fiber it is about to run.
            let event = unsafe { handle.as_ref().resume() };
            match event {
                Some(FiberEvent::Switch(next)) => {
                    // SAFETY: switch targets are live by the handshake.
                    if unsafe { next.as_ref().is_thread_root() } {
                        debug_assert_eq!(
                            next,
                            self.tls(self.current_thread_index()).thread_root,
                            "fiber switched to a foreign thread root"
                        );
                        return;
                    }
                    handle = next;
                }
                None => {
                    log::error!("fiber entry function returned instead of switching away");
                    panic!("fiber entry function returned");
                }
            }
        }
    }

    /// Switches execution from `from` to `to`, returning when `from` is next
    /// resumed. When `from` is a thread-root context (the main fiber during
    /// a wait), the switch is realized by pumping dispatch fibers on this
    /// stack until one of them switches back to the root.
    fn switch_fibers(&self, from: FiberHandle, to: FiberHandle) {
        // SAFETY: `from` is the fiber this code is executing on.
        if unsafe { from.as_ref().is_thread_root() } {
            self.pump(to);
        } else {
            unsafe { from.as_ref().switch(FiberEvent::Switch(to)) };
        }
    }

    /// The dispatch loop. Every dispatch fiber runs this from entry.
    fn fiber_proc(&self) {
        let mut thread_index = self.current_thread_index();
        let mut tls = self.tls(thread_index);

        if let Some(callbacks) = self.callbacks() {
            callbacks.on_fiber_attached(tls.current_fiber.get().id());
        }

        // A fresh-from-pool fiber may owe cleanup for the fiber it replaced.
        self.clean_up_old_fiber();

        let mut task_buffer: Vec<DispatchItem> = Vec::new();

        while !self.quit.load(Ordering::Acquire) {
            let mut waiting_fiber = FiberHandle::null();
            let mut saw_pinned_fibers = false;
            let mut next_task: Option<TaskBundle> = None;

            // Ready pinned fibers take precedence over everything else.
            {
                let mut pinned = tls.pinned_ready_fibers.lock();
                for i in 0..pinned.len() {
                    saw_pinned_fibers = true;
                    // SAFETY: entries in the pinned list are live bundles.
                    if !unsafe { pinned[i].as_ref().is_ready() } {
                        // The wait condition fired but the source thread has
                        // not switched away from the fiber yet; skip it until
                        // a later round.
                        continue;
                    }
                    let bundle = pinned.remove(i);
                    // SAFETY: removal makes us the sole holder.
                    waiting_fiber = unsafe { bundle.take_fiber() };
                    break;
                }
            }

            if waiting_fiber.is_null() {
                match self.get_next_hi_pri_task(&mut task_buffer) {
                    Some(DispatchItem::ReadyFiber(bundle)) => {
                        // SAFETY: the queue pop transferred sole ownership.
                        waiting_fiber = unsafe { bundle.take_fiber() };
                    }
                    Some(DispatchItem::Task(bundle)) => next_task = Some(bundle),
                    None => {}
                }
            }

            if waiting_fiber.is_null() && next_task.is_none() {
                match self.get_next_lo_pri_task() {
                    Some(DispatchItem::Task(bundle)) => next_task = Some(bundle),
                    Some(DispatchItem::ReadyFiber(_)) => {
                        // Ready fibers are only ever published to the hi-pri
                        // queues.
                        debug_assert!(false, "ready fiber found in a lo-pri queue");
                    }
                    None => {}
                }
            }

            if !waiting_fiber.is_null() {
                // Hand this carrier to the resumed fiber; our own fiber goes
                // back to the pool once the switch completes.
                let old_fiber = tls.current_fiber.get();
                tls.old_fiber.set(old_fiber);
                tls.current_fiber.set(waiting_fiber);
                tls.old_fiber_destination.set(FiberDestination::ToPool);

                if let Some(callbacks) = self.callbacks() {
                    callbacks.on_fiber_detached(old_fiber.id(), false);
                }

                // SAFETY: `old_fiber` is the fiber running this loop.
                unsafe { old_fiber.as_ref().switch(FiberEvent::Switch(waiting_fiber)) };

                // And we're back.
                if let Some(callbacks) = self.callbacks() {
                    callbacks.on_fiber_attached(self.current_fiber_handle().id());
                }
                self.clean_up_old_fiber();

                // The carrier may have changed across the suspension.
                thread_index = self.current_thread_index();
                tls = self.tls(thread_index);
                tls.failed_queue_pop_attempts.set(0);
            } else if let Some(bundle) = next_task {
                tls.failed_queue_pop_attempts.set(0);

                let TaskBundle {
                    task,
                    counter,
                    name,
                } = bundle;
                if let Some(name) = name {
                    log::trace!("worker {thread_index} executing task '{name}'");
                }
                task.run(self);
                if let Some(counter) = counter {
                    counter.decrement(self);
                }

                // The task may have waited and resumed on another carrier.
                thread_index = self.current_thread_index();
                tls = self.tls(thread_index);
            } else if !saw_pinned_fibers {
                match self.behavior() {
                    EmptyQueueBehavior::Spin => {}
                    EmptyQueueBehavior::Yield => {
                        let attempts = tls.failed_queue_pop_attempts.get() + 1;
                        tls.failed_queue_pop_attempts.set(attempts);
                        if attempts >= FAILED_POP_ATTEMPTS_HEURISTIC {
                            thread::yield_now();
                            tls.failed_queue_pop_attempts.set(0);
                        }
                    }
                    EmptyQueueBehavior::Sleep => {
                        let attempts = tls.failed_queue_pop_attempts.get() + 1;
                        tls.failed_queue_pop_attempts.set(attempts);
                        if attempts >= FAILED_POP_ATTEMPTS_HEURISTIC {
                            let mut sleep_guard = self.thread_sleep_lock.lock();
                            // Re-check the wake conditions under the sleep
                            // lock: wakers set their state first and notify
                            // while holding this lock, so either we observe
                            // the state here and skip the sleep, or we are
                            // already waiting when the notify lands.
                            let pinned_empty = tls.pinned_ready_fibers.lock().is_empty();
                            if pinned_empty
                                && !self.quit.load(Ordering::Acquire)
                                && self.behavior() == EmptyQueueBehavior::Sleep
                            {
                                self.thread_sleep_cv.wait(&mut sleep_guard);
                            }
                            drop(sleep_guard);
                            tls.failed_queue_pop_attempts.set(0);
                        }
                    }
                }
            }
        }

        // Quit: leave through this thread's quit fiber, which frees us.
        if let Some(callbacks) = self.callbacks() {
            callbacks.on_fiber_detached(tls.current_fiber.get().id(), false);
        }
        let index = self.current_thread_index();
        let tls = self.tls(index);
        let current = tls.current_fiber.get();
        // SAFETY: quit fibers are created before `quit` is published.
        let quit_fiber = unsafe { (&*self.quit_fibers.get())[index] };
        tls.old_fiber.set(current);
        tls.old_fiber_destination.set(FiberDestination::ToPool);
        tls.current_fiber.set(quit_fiber);
        // SAFETY: `current` is the fiber running this loop.
        unsafe { current.as_ref().switch(FiberEvent::Switch(quit_fiber)) };

        log::error!("dispatch fiber resumed after switching to its quit fiber");
    }

    /// Entry of the per-thread quit fibers: barrier until every carrier has
    /// left its dispatch loop, then return the OS thread to its own stack.
    fn thread_end_proc(&self, index: usize) {
        // The dispatch fiber that switched here marked itself ToPool.
        self.clean_up_old_fiber();

        self.quit_count.fetch_add(1, Ordering::SeqCst);
        while self.quit_count.load(Ordering::SeqCst) != self.num_threads() {
            thread::sleep(Duration::from_millis(1));
        }

        // For worker 0 the thread root is the main fiber, so this resumes
        // the scheduler's destructor.
        let root = self.tls(index).thread_root;
        // SAFETY: quit fiber `index` runs on thread `index`.
        let quit_fiber = unsafe { (&*self.quit_fibers.get())[index] };
        unsafe { quit_fiber.as_ref().switch(FiberEvent::Switch(root)) };

        log::error!("quit fiber resumed after returning to its thread root");
    }

    /// Pops (or steals) the next high-priority item, filtering out ready
    /// fibers whose parking thread has not completed the switch yet. Held
    /// items go into `task_buffer` and are re-pushed before returning.
    fn get_next_hi_pri_task(&self, task_buffer: &mut Vec<DispatchItem>) -> Option<DispatchItem> {
        let current_thread_index = self.current_thread_index();
        let tls = self.tls(current_thread_index);
        let mut result = None;

        // Our own queue first.
        // SAFETY: we are the owning worker of this queue.
        while let Some(item) = unsafe { tls.hi_pri_task_queue.pop() } {
            if item.is_ready() {
                result = Some(item);
                break;
            }
            task_buffer.push(item);
        }

        if result.is_none() {
            // Ours is exhausted; try to steal, starting from the last victim
            // that yielded anything.
            let start = tls.hi_pri_last_successful_steal.get();
            'victims: for i in 0..self.num_threads() {
                let victim = (start + i) % self.num_threads();
                if victim == current_thread_index {
                    continue;
                }
                let other = self.tls(victim);
                loop {
                    match other.hi_pri_task_queue.steal() {
                        Steal::Success(item) => {
                            tls.hi_pri_last_successful_steal.set(victim);
                            if item.is_ready() {
                                result = Some(item);
                                break 'victims;
                            }
                            task_buffer.push(item);
                        }
                        Steal::Empty | Steal::Retry => break,
                    }
                }
            }
        }

        if !task_buffer.is_empty() {
            // Re-push held items in reverse pop order to restore the queue
            // order; we or another worker will see them next round.
            while let Some(item) = task_buffer.pop() {
                // SAFETY: we own this queue.
                unsafe { tls.hi_pri_task_queue.push(item) };
            }
            // Other workers may have gone to sleep while every remaining
            // item sat in our buffer.
            if self.behavior() == EmptyQueueBehavior::Sleep {
                self.thread_sleep_cv.notify_all();
            }
        }

        result
    }

    /// Pops (or steals) the next normal-priority item. No readiness filter:
    /// this queue only ever carries real tasks.
    fn get_next_lo_pri_task(&self) -> Option<DispatchItem> {
        let current_thread_index = self.current_thread_index();
        let tls = self.tls(current_thread_index);

        // SAFETY: we are the owning worker of this queue.
        if let Some(item) = unsafe { tls.lo_pri_task_queue.pop() } {
            return Some(item);
        }

        let start = tls.lo_pri_last_successful_steal.get();
        for i in 0..self.num_threads() {
            let victim = (start + i) % self.num_threads();
            if victim == current_thread_index {
                continue;
            }
            if let Steal::Success(item) = self.tls(victim).lo_pri_task_queue.steal() {
                tls.lo_pri_last_successful_steal.set(victim);
                return Some(item);
            }
        }
        None
    }

    /// Completes the handoff of the fiber this carrier switched away from.
    ///
    /// A fiber cannot publish its own stack: between pushing itself
    /// somewhere visible and finishing the switch, another carrier could
    /// resume it and corrupt the live stack. Instead the *receiving* fiber
    /// completes the handoff. Control flow guarantees every fiber entry and
    /// every return from a switch lands here, so exactly one cleanup runs
    /// per switch:
    /// - `ToPool`: the old fiber was a dispatch fiber that found work for
    ///   this carrier; nothing else references it, free it.
    /// - `ToWaiting`: the old fiber parked; setting its bundle's switched
    ///   flag is what makes it legal for a resumer to pick it up.
    fn clean_up_old_fiber(&self) {
        let tls = self.tls(self.current_thread_index());
        match tls.old_fiber_destination.get() {
            FiberDestination::ToPool => {
                // SAFETY: the old fiber completed its switch away (we are the
                // fiber it switched to) and no other reference remains.
                unsafe { tls.old_fiber.get().free() };
                tls.old_fiber_destination.set(FiberDestination::None);
                tls.old_fiber.set(FiberHandle::null());
            }
            FiberDestination::ToWaiting => {
                let flag = tls.old_fiber_stored_flag.get();
                // SAFETY: the bundle outlives this store; its releaser only
                // runs after observing the flag we are about to set.
                unsafe { (*flag).store(true, Ordering::Release) };
                tls.old_fiber_destination.set(FiberDestination::None);
                tls.old_fiber.set(FiberHandle::null());
            }
            FiberDestination::None => {}
        }
    }

    /// Republishes a satisfied waiter so some carrier resumes it.
    pub(crate) fn add_ready_fiber(&self, pinned_thread: Option<usize>, bundle: ReadyFiberRef) {
        match pinned_thread {
            None => {
                let tls = self.tls(self.current_thread_index_or_zero());
                // SAFETY: we are (or stand in for) the owner of this queue.
                unsafe {
                    tls.hi_pri_task_queue
                        .push(DispatchItem::ReadyFiber(bundle));
                }
                // A sleeping worker will not otherwise notice the new item.
                if self.behavior() == EmptyQueueBehavior::Sleep {
                    self.thread_sleep_cv.notify_one();
                }
            }
            Some(pinned) => {
                let tls = self.tls(pinned);
                tls.pinned_ready_fibers.lock().push(bundle);

                // The pinned worker will find the bundle on its next scan;
                // but under Sleep it might be parked, and only a wake from
                // here gets it moving again.
                if self.behavior() == EmptyQueueBehavior::Sleep
                    && self.get_current_thread_index() != Some(pinned)
                {
                    let _guard = self.thread_sleep_lock.lock();
                    self.thread_sleep_cv.notify_all();
                }
            }
        }
    }

    /// Allocates a fresh dispatch fiber.
    fn get_next_free_fiber(&self) -> FiberHandle {
        let scheduler = SendPtr(self as *const TaskScheduler);
        let fiber = Fiber::new(self.fiber_stack_size.get(), move || {
            // Force capture of the whole `SendPtr` (not just its `.0`
            // field) so the closure stays `Send`.
            let scheduler = scheduler;
            // SAFETY: fibers never outlive the scheduler that created them.
            let scheduler = unsafe { &*scheduler.0 };
            scheduler.fiber_proc();
        })
        .expect("failed to allocate a fiber stack");
        FiberHandle(Box::into_raw(fiber))
    }

    fn behavior(&self) -> EmptyQueueBehavior {
        EmptyQueueBehavior::from_u8(self.empty_queue_behavior.load(Ordering::Relaxed))
    }

    fn callbacks(&self) -> Option<&Arc<dyn EventCallbacks>> {
        // SAFETY: written only before workers start (init) and read-only
        // afterwards.
        unsafe { (*self.callbacks.get()).as_ref() }
    }

    fn tls(&self, index: usize) -> &ThreadLocalStorage {
        // SAFETY: the TLS array is written once during init, before
        // `initialized` is published, and never resized afterwards.
        unsafe { &(&*self.tls.get())[index] }
    }

    fn current_thread_index(&self) -> usize {
        self.get_current_thread_index()
            .expect("operation requires a thread owned by the scheduler")
    }

    fn current_thread_index_or_zero(&self) -> usize {
        self.get_current_thread_index().unwrap_or(0)
    }

    fn current_fiber_handle(&self) -> FiberHandle {
        self.tls(self.current_thread_index()).current_fiber.get()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if !self.initialized.load(Ordering::Acquire) {
            // Never (fully) initialized; only the thread-root stand-ins may
            // exist.
            // SAFETY: no worker is running (a failed init joined them all).
            unsafe {
                for tls in (*self.tls.get()).drain(..) {
                    tls.thread_root.free();
                }
            }
            return;
        }

        let num_threads = self.num_threads();

        // Quit fibers must exist before any dispatch loop can observe `quit`.
        let mut quit_fibers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let scheduler = SendPtr(self as *const TaskScheduler);
            let fiber = Fiber::new(self.fiber_stack_size.get(), move || {
                // Force capture of the whole `SendPtr` (not just its `.0`
                // field) so the closure stays `Send`.
                let scheduler = scheduler;
                // SAFETY: quit fibers run strictly before teardown completes.
                let scheduler = unsafe { &*scheduler.0 };
                scheduler.thread_end_proc(i);
            })
            .expect("failed to allocate a fiber stack");
            quit_fibers.push(FiberHandle(Box::into_raw(fiber)));
        }
        // SAFETY: published to the workers by the release store of `quit`.
        unsafe {
            *self.quit_fibers.get() = quit_fibers;
        }

        self.quit.store(true, Ordering::Release);

        // Wake any sleeping carriers so they observe `quit`. Unconditional:
        // a carrier could still be parked from before a runtime policy
        // change.
        {
            let _guard = self.thread_sleep_lock.lock();
            self.thread_sleep_cv.notify_all();
        }

        // Jump to this thread's quit fiber; it returns control here once all
        // carriers have wound down.
        {
            if let Some(callbacks) = self.callbacks() {
                callbacks.on_fiber_detached(self.current_fiber_handle().id(), false);
            }
            let index = self.current_thread_index();
            let current = self.tls(index).current_fiber.get();
            // SAFETY: quit fibers were just created.
            let quit_fiber = unsafe { (&*self.quit_fibers.get())[index] };
            self.switch_fibers(current, quit_fiber);
        }

        // Back on the initializing thread; the pool has quiesced.
        // SAFETY: all dispatch loops have exited; joining is plain teardown.
        unsafe {
            for handle in (*self.threads.get()).drain(..) {
                if handle.join().is_err() {
                    log::error!("worker thread panicked during shutdown");
                }
            }
            for quit_fiber in (*self.quit_fibers.get()).drain(..) {
                quit_fiber.free();
            }
            for tls in (*self.tls.get()).drain(..) {
                tls.thread_root.free();
            }
        }
        log::debug!("task scheduler shut down");
    }
}
