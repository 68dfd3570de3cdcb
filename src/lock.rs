//! Locks for [`SharedHeap`](crate::SharedHeap)
use const_default1::ConstDefault;
use core::{cell::Cell, marker::PhantomData};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
#[cfg_attr(feature = "doc_cfg", doc(cfg(unix)))]
pub use self::unix::PthreadMutex;

/// A lock guarding a [`SharedHeap`](crate::SharedHeap).
///
/// # Safety
///
/// Between a call to `acquire` and the matching call to `release`, no other
/// call to `acquire` on the same lock may return, on any thread or in any
/// interrupt handler from which the lock is used.
pub unsafe trait RawLock {
    /// The state to restore when the lock is released.
    type State;

    fn acquire(&self) -> Self::State;

    /// # Safety
    ///
    /// `state` must be the value returned by the last unmatched call to
    /// `acquire`.
    unsafe fn release(&self, state: Self::State);
}

/// Doesn't lock anything. This type is `!Sync`, so a shared heap using it
/// can only be used from a single context.
#[derive(Debug, Default)]
pub struct NoLock(PhantomData<Cell<()>>);

impl NoLock {
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl ConstDefault for NoLock {
    const DEFAULT: Self = Self::new();
}

// Safety: `NoLock` can't be shared between threads
unsafe impl RawLock for NoLock {
    type State = ();

    #[inline]
    fn acquire(&self) {}

    #[inline]
    unsafe fn release(&self, _state: ()) {}
}

/// Uses the `critical-section` crate, which is typically implemented by
/// masking interrupts on single-core targets.
#[cfg(feature = "critical-section")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "critical-section")))]
#[derive(Debug, Default)]
pub struct CriticalSectionLock(());

#[cfg(feature = "critical-section")]
impl CriticalSectionLock {
    pub const fn new() -> Self {
        Self(())
    }
}

#[cfg(feature = "critical-section")]
impl ConstDefault for CriticalSectionLock {
    const DEFAULT: Self = Self::new();
}

// Safety: A critical section excludes every other critical section
#[cfg(feature = "critical-section")]
unsafe impl RawLock for CriticalSectionLock {
    type State = critical_section::RestoreState;

    #[inline]
    fn acquire(&self) -> Self::State {
        // Safety: Released by `release`
        unsafe { critical_section::acquire() }
    }

    #[inline]
    unsafe fn release(&self, state: Self::State) {
        critical_section::release(state)
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "critical-section")] {
        /// The lock used by [`SharedHeap`](crate::SharedHeap) by default.
        pub type DefaultLock = CriticalSectionLock;
    } else if #[cfg(unix)] {
        /// The lock used by [`SharedHeap`](crate::SharedHeap) by default.
        pub type DefaultLock = PthreadMutex;
    } else {
        /// The lock used by [`SharedHeap`](crate::SharedHeap) by default.
        pub type DefaultLock = NoLock;
    }
}
