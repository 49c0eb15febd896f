//! Wait-free work-stealing deque.
//!
//! A single-owner deque in the Chase–Lev style: the owning worker pushes and
//! pops at the bottom (LIFO), thieves steal from the top (approximate FIFO).
//! All operations are lock-free. `pop` can lose its last element to a
//! concurrent thief and `steal` can return [`Steal::Retry`] under contention;
//! neither ever succeeds erroneously.
//!
//! The buffer grows on demand. Retired buffers are kept alive until the deque
//! is dropped, so a thief that loaded an old buffer pointer always reads
//! valid memory; the compare-and-swap on `top` decides whether its
//! speculative read is kept or discarded.

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{fence, AtomicIsize, AtomicPtr, Ordering};

const INITIAL_CAPACITY: usize = 64;

/// Outcome of a [`WaitFreeQueue::steal`] attempt.
pub(crate) enum Steal<T> {
    /// An element was taken from the top of the deque.
    Success(T),
    /// The deque was observed empty.
    Empty,
    /// Lost a race with the owner or another thief; the caller may retry or
    /// move on to the next victim.
    Retry,
}

struct Buffer<T> {
    storage: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// `capacity - 1`; capacity is always a power of two.
    mask: usize,
}

impl<T> Buffer<T> {
    fn alloc(capacity: usize) -> *mut Buffer<T> {
        debug_assert!(capacity.is_power_of_two());
        let storage = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Box::into_raw(Box::new(Buffer {
            storage,
            mask: capacity - 1,
        }))
    }

    fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn slot(&self, index: isize) -> *mut MaybeUninit<T> {
        self.storage[index as usize & self.mask].get()
    }

    /// Bitwise read of the element at `index`. Ownership of the value is only
    /// established by the caller winning the subsequent CAS (or, for the
    /// owner, by the bottom/top arithmetic proving exclusivity).
    unsafe fn read(&self, index: isize) -> T {
        ptr::read((*self.slot(index)).as_ptr())
    }

    unsafe fn write(&self, index: isize, value: T) {
        ptr::write((*self.slot(index)).as_mut_ptr(), value);
    }
}

/// Single-producer, multi-consumer work-stealing deque of `T`.
pub(crate) struct WaitFreeQueue<T> {
    bottom: CachePadded<AtomicIsize>,
    top: CachePadded<AtomicIsize>,
    buffer: AtomicPtr<Buffer<T>>,
    /// Buffers replaced by `grow`, freed on drop. Owner-only.
    retired: UnsafeCell<Vec<*mut Buffer<T>>>,
}

// SAFETY: elements cross threads via steal, and the owner-only parts
// (`push`/`pop`/`retired`) are guarded by the caller contract below.
unsafe impl<T: Send> Send for WaitFreeQueue<T> {}
unsafe impl<T: Send> Sync for WaitFreeQueue<T> {}

impl<T> WaitFreeQueue<T> {
    pub(crate) fn new() -> Self {
        WaitFreeQueue {
            bottom: CachePadded::new(AtomicIsize::new(0)),
            top: CachePadded::new(AtomicIsize::new(0)),
            buffer: AtomicPtr::new(Buffer::alloc(INITIAL_CAPACITY)),
            retired: UnsafeCell::new(Vec::new()),
        }
    }

    /// Pushes an element onto the bottom of the deque.
    ///
    /// # Safety
    ///
    /// Must only be called by the owning worker; `push` and `pop` are not
    /// safe to run concurrently with each other.
    pub(crate) unsafe fn push(&self, value: T) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let mut buffer = self.buffer.load(Ordering::Relaxed);

        if b - t >= (*buffer).capacity() as isize {
            buffer = self.grow(b, t, buffer);
        }

        (*buffer).write(b, value);
        self.bottom.store(b + 1, Ordering::Release);
    }

    /// Pops an element from the bottom of the deque. Returns `None` if the
    /// deque is empty or the last element was lost to a concurrent thief.
    ///
    /// # Safety
    ///
    /// Must only be called by the owning worker.
    pub(crate) unsafe fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        let buffer = self.buffer.load(Ordering::Relaxed);
        self.bottom.store(b, Ordering::Relaxed);
        // Make the speculative bottom decrement visible before reading top,
        // so a concurrent thief and this pop cannot both take the last slot.
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            // Already empty; restore.
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        if t == b {
            // Single element left: race the thieves for it.
            let won = self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(b + 1, Ordering::Relaxed);
            if !won {
                return None;
            }
        }

        Some((*buffer).read(b))
    }

    /// Attempts to steal an element from the top of the deque. Callable from
    /// any thread.
    pub(crate) fn steal(&self) -> Steal<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t >= b {
            return Steal::Empty;
        }

        let buffer = self.buffer.load(Ordering::Acquire);
        // SAFETY: a speculative bitwise copy; the buffer is never freed while
        // the deque is live, and the CAS below decides whether we own it.
        let value = unsafe { (*buffer).read(t) };
        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            // Lost the race; the copy must not be dropped.
            mem::forget(value);
            return Steal::Retry;
        }
        Steal::Success(value)
    }

    /// Doubles the buffer, copying the live range `[t, b)`. The old buffer is
    /// retired rather than freed: thieves may still hold a pointer to it.
    unsafe fn grow(&self, b: isize, t: isize, old: *mut Buffer<T>) -> *mut Buffer<T> {
        let new = Buffer::alloc((*old).capacity() * 2);
        for i in t..b {
            ptr::copy_nonoverlapping((*old).slot(i), (*new).slot(i), 1);
        }
        self.buffer.store(new, Ordering::Release);
        (*self.retired.get()).push(old);
        new
    }
}

impl<T> Drop for WaitFreeQueue<T> {
    fn drop(&mut self) {
        let buffer = self.buffer.load(Ordering::Relaxed);
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        unsafe {
            for i in t..b {
                drop((*buffer).read(i));
            }
            drop(Box::from_raw(buffer));
            for retired in (*self.retired.get()).drain(..) {
                drop(Box::from_raw(retired));
            }
        }
    }
}
