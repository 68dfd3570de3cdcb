use const_default1::ConstDefault;
use core::{cell::UnsafeCell, fmt};

use super::RawLock;

/// A `pthread_mutex_t`.
///
/// `pthread_mutex_t` might be unsafe to move, so a `PthreadMutex` must not be
/// moved after it has been locked for the first time. Placing it in a
/// `static` satisfies this.
pub struct PthreadMutex(UnsafeCell<libc::pthread_mutex_t>);

// Safety: `pthread_mutex_t` is designed to be shared between threads
unsafe impl Send for PthreadMutex {}
unsafe impl Sync for PthreadMutex {}

impl PthreadMutex {
    pub const fn new() -> Self {
        Self(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER))
    }
}

impl ConstDefault for PthreadMutex {
    const DEFAULT: Self = Self::new();
}

impl Default for PthreadMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PthreadMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PthreadMutex")
    }
}

// Safety: `pthread_mutex_lock` provides mutual exclusion
unsafe impl RawLock for PthreadMutex {
    type State = ();

    #[inline]
    fn acquire(&self) {
        let ret = unsafe { libc::pthread_mutex_lock(self.0.get()) };
        if ret != 0 {
            // Nothing sensible can be done with a broken mutex
            unsafe { libc::abort() };
        }
    }

    #[inline]
    unsafe fn release(&self, _state: ()) {
        libc::pthread_mutex_unlock(self.0.get());
    }
}
