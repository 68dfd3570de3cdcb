//! The process-wide heap
use const_default1::ConstDefault;
use core::{
    cell::UnsafeCell,
    fmt,
    hint::unreachable_unchecked,
    mem::{self, MaybeUninit},
    ops,
    ptr::NonNull,
};

use crate::{
    config::{DefaultOptions, InitError, Options, RegionConfig},
    heap::Heap,
    info::HeapInfo,
    integrity::Corruption,
    lock::{DefaultLock, RawLock},
    telemetry::{NoRecorder, Recorder},
};

/// A [`Heap`] behind a lock, suitable for a `static`.
///
/// The heap is created from its [`RegionConfig`] by the first operation, or
/// explicitly by [`Self::init`].
///
/// # Examples
///
/// ```
/// use bixheap::{RegionConfig, SharedHeap, NoRecorder};
/// use std::mem::MaybeUninit;
///
/// static HEAP: SharedHeap = unsafe {
///     SharedHeap::new(RegionConfig { base: 0, len: 0 }, NoRecorder)
/// };
///
/// let pool = Box::leak(Box::new([MaybeUninit::<u8>::uninit(); 4096]));
/// HEAP.init(pool).unwrap();
///
/// let ptr = HEAP.allocate(32).unwrap();
/// unsafe { HEAP.release(Some(ptr)) };
/// ```
pub struct SharedHeap<L = DefaultLock, O = DefaultOptions, R = NoRecorder> {
    inner: UnsafeCell<State<O, R>>,
    lock: L,
}

enum State<O, R> {
    Pending { config: RegionConfig, recorder: R },
    Ready(Heap<'static, O, R>),
    /// The initialization has failed or is in progress.
    Failed,
}

// Safety: The heap is only accessed while `lock` is held. The recorder may
//         be dropped or used from whichever thread holds the lock.
unsafe impl<L: RawLock + Sync, O, R: Send> Sync for SharedHeap<L, O, R> {}

impl<L, O, R> fmt::Debug for SharedHeap<L, O, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedHeap")
    }
}

impl<L: ConstDefault, O, R> SharedHeap<L, O, R> {
    /// Construct a `SharedHeap` that will manage the region described by
    /// `config`.
    ///
    /// # Safety
    ///
    /// Unless [`Self::init`] is called before any other method, the region
    /// must be valid for reads and writes, must not be used by anything
    /// else, and must stay so for the rest of the program.
    pub const unsafe fn new(config: RegionConfig, recorder: R) -> Self {
        Self {
            inner: UnsafeCell::new(State::Pending { config, recorder }),
            lock: L::DEFAULT,
        }
    }
}

impl<L: RawLock, O: Options, R: Recorder> SharedHeap<L, O, R> {
    /// Create the heap on `pool` instead of the configured region.
    ///
    /// Fails with [`InitError::AlreadyInitialized`] if the heap has already
    /// been created.
    pub fn init(&self, pool: &'static mut [MaybeUninit<u8>]) -> Result<(), InitError> {
        let _guard = self.lock();
        // Safety: Protected by `lock`
        let state = unsafe { &mut *self.inner.get() };
        match mem::replace(state, State::Failed) {
            State::Pending { recorder, .. } => {
                let result = Heap::with_recorder(pool, recorder);
                Self::settle(state, result)
            }
            other => {
                *state = other;
                Err(InitError::AlreadyInitialized)
            }
        }
    }

    fn settle(
        state: &mut State<O, R>,
        result: Result<Heap<'static, O, R>, InitError>,
    ) -> Result<(), InitError> {
        match result {
            Ok(heap) => {
                *state = State::Ready(heap);
                Ok(())
            }
            Err(e) => {
                log::error!("failed to initialize the shared heap: {}", e);
                Err(e)
            }
        }
    }

    #[inline]
    fn lock(&self) -> LockGuard<'_, L> {
        LockGuard {
            lock: &self.lock,
            state: Some(self.lock.acquire()),
        }
    }

    /// Acquire the lock and get the heap, creating it if necessary.
    fn lock_heap(&self) -> Option<HeapGuard<'_, L, O, R>> {
        let guard = self.lock();
        // Safety: Protected by `lock`
        let state = unsafe { &mut *self.inner.get() };
        if let State::Pending { .. } = state {
            if let State::Pending { config, recorder } = mem::replace(state, State::Failed) {
                let result = if config.base == 0 {
                    Err(InitError::NullBase)
                } else {
                    // Safety: The region's validity is upheld by the caller
                    //         of `new`
                    unsafe {
                        Heap::from_raw_parts(
                            NonNull::new_unchecked(config.base as *mut u8),
                            config.len,
                            recorder,
                        )
                    }
                };
                let _ = Self::settle(state, result);
            }
        }
        match state {
            State::Ready(_) => Some(HeapGuard {
                _guard: guard,
                heap: self,
            }),
            _ => None,
        }
    }

    /// Run `f` with exclusive access to the heap.
    ///
    /// Returns `None` if the heap couldn't be created.
    pub fn with<T>(&self, f: impl FnOnce(&mut Heap<'static, O, R>) -> T) -> Option<T> {
        let mut heap = self.lock_heap()?;
        Some(f(&mut heap))
    }

    /// See [`Heap::allocate`].
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.lock_heap()?.allocate(size)
    }

    /// See [`Heap::allocate_zeroed`].
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        self.lock_heap()?.allocate_zeroed(count, size)
    }

    /// See [`Heap::release`].
    ///
    /// # Safety
    ///
    /// See [`Heap::release`].
    pub unsafe fn release(&self, ptr: Option<NonNull<u8>>) {
        if ptr.is_none() {
            return;
        }
        if let Some(mut heap) = self.lock_heap() {
            heap.release(ptr);
        }
    }

    /// See [`Heap::resize`].
    ///
    /// # Safety
    ///
    /// See [`Heap::resize`].
    pub unsafe fn resize(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        self.lock_heap()?.resize(ptr, size)
    }

    /// See [`Heap::free_bytes_remaining`]. Returns zero if the heap couldn't
    /// be created.
    pub fn free_bytes_remaining(&self) -> usize {
        self.lock_heap()
            .map_or(0, |heap| heap.free_bytes_remaining())
    }

    /// See [`Heap::info`].
    pub fn info(&self) -> Option<HeapInfo> {
        Some(self.lock_heap()?.info())
    }

    /// See [`Heap::dump`].
    pub fn dump(&self, ptr: Option<NonNull<u8>>, force: bool) -> Option<NonNull<u8>> {
        self.lock_heap()?.dump(ptr, force)
    }

    /// See [`Heap::check_integrity`]. Succeeds if the heap couldn't be
    /// created.
    pub fn check_integrity(&self) -> Result<(), Corruption> {
        self.lock_heap()
            .map_or(Ok(()), |heap| heap.check_integrity())
    }

    /// See [`Heap::check_poison`]. Succeeds if the heap couldn't be created.
    pub fn check_poison(&self) -> Result<(), Corruption> {
        self.lock_heap()
            .map_or(Ok(()), |heap| heap.check_poison())
    }

    /// See [`Heap::set_corruption_handler`].
    pub fn set_corruption_handler(&self, handler: fn()) {
        if let Some(mut heap) = self.lock_heap() {
            heap.set_corruption_handler(handler);
        }
    }
}

struct LockGuard<'a, L: RawLock> {
    lock: &'a L,
    state: Option<L::State>,
}

impl<L: RawLock> Drop for LockGuard<'_, L> {
    #[inline]
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            // Safety: `state` was returned by the matching `acquire`
            unsafe { self.lock.release(state) };
        }
    }
}

struct HeapGuard<'a, L: RawLock, O, R> {
    _guard: LockGuard<'a, L>,
    heap: &'a SharedHeap<L, O, R>,
}

impl<L: RawLock, O, R> ops::Deref for HeapGuard<'_, L, O, R> {
    type Target = Heap<'static, O, R>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Safety: Protected by `lock`
        match unsafe { &*self.heap.inner.get() } {
            State::Ready(heap) => heap,
            // Safety: `HeapGuard` is only created for a ready heap
            _ => unsafe { unreachable_unchecked() },
        }
    }
}

impl<L: RawLock, O, R> ops::DerefMut for HeapGuard<'_, L, O, R> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: Protected by `lock`
        match unsafe { &mut *self.heap.inner.get() } {
            State::Ready(heap) => heap,
            // Safety: `HeapGuard` is only created for a ready heap
            _ => unsafe { unreachable_unchecked() },
        }
    }
}
