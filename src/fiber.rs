//! Fiber management and execution contexts.
//!
//! A [`Fiber`] is a resumable user-space execution context with its own stack,
//! built on `corosensei` stackful coroutines. Carriers (OS worker threads)
//! resume fibers; a running fiber hands control back to its carrier with a
//! [`FiberEvent`] naming the fiber to run next. The carrier's own OS stack
//! plays the role of the "thread fiber": it is represented by a [`Fiber`]
//! with no coroutine attached, and switching to it simply returns control to
//! the code that pumped the carrier.

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::{Cell, UnsafeCell};
use std::io;

/// Raw pointer wrapper that can be captured by `Send` closures.
///
/// The pointee is only ever dereferenced under the scheduler's ownership
/// discipline; the wrapper exists so fiber entry closures can carry the
/// scheduler and fiber addresses across threads.
pub(crate) struct SendPtr<T: ?Sized>(pub(crate) *const T);

unsafe impl<T: ?Sized> Send for SendPtr<T> {}
unsafe impl<T: ?Sized> Sync for SendPtr<T> {}

impl<T: ?Sized> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        SendPtr(self.0)
    }
}

impl<T: ?Sized> Copy for SendPtr<T> {}

/// Opaque identity of a fiber, stable for the fiber's lifetime.
///
/// Passed to [`EventCallbacks`](crate::callbacks::EventCallbacks) so a
/// profiler can track which context a carrier is executing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FiberId(pub(crate) usize);

/// What a running fiber asks of its carrier when it suspends.
pub(crate) enum FiberEvent {
    /// Resume this fiber next. If the target is a thread-root context, the
    /// carrier's pump returns instead, handing control back to the OS stack
    /// that entered it.
    Switch(FiberHandle),
}

type FiberCoroutine = Coroutine<(), FiberEvent, ()>;
type FiberYielder = Yielder<(), FiberEvent>;

/// A `Send`-capable handle to a heap-allocated [`Fiber`].
///
/// Handles are plain copies of a raw pointer; exactly one place in the
/// scheduler logically owns each fiber at any instant (a TLS slot, a counter
/// waiter slot, or a ready-fiber bundle). The owner is responsible for
/// eventually freeing the fiber with [`FiberHandle::free`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct FiberHandle(pub(crate) *mut Fiber);

unsafe impl Send for FiberHandle {}
unsafe impl Sync for FiberHandle {}

impl FiberHandle {
    pub(crate) fn null() -> Self {
        FiberHandle(std::ptr::null_mut())
    }

    pub(crate) fn is_null(self) -> bool {
        self.0.is_null()
    }

    pub(crate) fn id(self) -> FiberId {
        FiberId(self.0 as usize)
    }

    /// # Safety
    ///
    /// The handle must point to a live fiber.
    pub(crate) unsafe fn as_ref<'a>(self) -> &'a Fiber {
        &*self.0
    }

    /// Frees the fiber. If its coroutine is still suspended, the stack is
    /// unwound by `corosensei` before the memory is released.
    ///
    /// # Safety
    ///
    /// The caller must logically own the handle, no other copy of it may be
    /// used afterwards, and no carrier may currently be executing the fiber.
    pub(crate) unsafe fn free(self) {
        drop(Box::from_raw(self.0));
    }
}

/// A resumable execution context.
///
/// Fibers are created suspended and run only when a carrier resumes them. A
/// fiber constructed with [`Fiber::thread_root`] has no coroutine: it stands
/// in for an OS thread's own call stack and is never resumed directly.
pub(crate) struct Fiber {
    /// The coroutine backing this fiber, or `None` for thread-root contexts.
    ///
    /// Wrapped in `UnsafeCell` so a carrier can resume through a shared
    /// handle; the ownership discipline guarantees at most one carrier
    /// touches a fiber at a time.
    coroutine: UnsafeCell<Option<FiberCoroutine>>,

    /// Set by the fiber itself on first entry; lets scheduler code suspend
    /// from arbitrarily deep call frames. Valid while the coroutine is live.
    yielder: Cell<*const FiberYielder>,
}

// SAFETY: a fiber is live on at most one thread at any instant. Carriers
// resume through `UnsafeCell` under that discipline, and `yielder` is only
// written and read by the fiber's own code while it is running.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a new fiber with the given stack size. The entry function does
    /// not run until the fiber is first resumed.
    pub(crate) fn new<F>(stack_size: usize, entry: F) -> io::Result<Box<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let fiber = Box::new(Fiber {
            coroutine: UnsafeCell::new(None),
            yielder: Cell::new(std::ptr::null()),
        });

        // The box gives the fiber a stable address, so the coroutine body can
        // stash its yielder in the struct once it starts running.
        let self_ptr = SendPtr(&*fiber as *const Fiber);
        let stack = DefaultStack::new(stack_size)?;
        let coroutine = Coroutine::with_stack(stack, move |yielder, ()| {
            // SAFETY: the fiber box outlives its coroutine, and only the
            // fiber's own code touches `yielder`.
            unsafe {
                (*self_ptr.0).yielder.set(yielder as *const FiberYielder);
            }
            entry();
        });

        // SAFETY: the fiber has not been shared yet; this is plain init.
        unsafe {
            *fiber.coroutine.get() = Some(coroutine);
        }
        Ok(fiber)
    }

    /// Creates the stand-in fiber for an OS thread's own call stack.
    pub(crate) fn thread_root() -> Box<Fiber> {
        Box::new(Fiber {
            coroutine: UnsafeCell::new(None),
            yielder: Cell::new(std::ptr::null()),
        })
    }

    pub(crate) fn is_thread_root(&self) -> bool {
        // SAFETY: read-only peek; `coroutine` is only mutated at construction
        // and by the single carrier currently resuming the fiber.
        unsafe { (*self.coroutine.get()).is_none() }
    }

    /// Runs the fiber until it suspends with an event or its entry returns.
    ///
    /// Returns `None` when the entry function returned, which the scheduler
    /// treats as a fatal error: dispatch and quit fibers always leave by
    /// switching, never by returning.
    ///
    /// # Safety
    ///
    /// The caller must be the sole carrier of this fiber, and the fiber must
    /// be suspended (not currently running on any thread).
    pub(crate) unsafe fn resume(&self) -> Option<FiberEvent> {
        let coroutine = (*self.coroutine.get())
            .as_mut()
            .expect("attempted to resume a thread-root context");
        match coroutine.resume(()) {
            CoroutineResult::Yield(event) => Some(event),
            CoroutineResult::Return(()) => None,
        }
    }

    /// Suspends the running fiber, handing `event` to its carrier. Returns
    /// when some carrier resumes this fiber again.
    ///
    /// # Safety
    ///
    /// Must be called from code executing inside this fiber.
    pub(crate) unsafe fn switch(&self, event: FiberEvent) {
        let yielder = self.yielder.get();
        debug_assert!(!yielder.is_null(), "fiber suspended before first entry");
        (*yielder).suspend(event);
    }
}
