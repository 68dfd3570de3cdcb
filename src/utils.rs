use core::ptr::NonNull;

/// Get the length of a slice pointer.
///
/// # Safety
///
/// `ptr` must be dereferencable. This is a limitation of the polyfill used on
/// compilers older than 1.63.
#[rustversion::since(1.63)]
#[inline]
pub unsafe fn nonnull_slice_len<T>(ptr: NonNull<[T]>) -> usize {
    ptr.len()
}

/// Polyfill for <https://github.com/rust-lang/rust/issues/71146>
///
/// # Safety
///
/// `ptr` must be dereferencable. This is a limitation of the polyfill.
#[rustversion::before(1.63)]
#[inline]
pub unsafe fn nonnull_slice_len<T>(ptr: NonNull<[T]>) -> usize {
    use core::{cell::UnsafeCell, mem::MaybeUninit};
    // Safety: We are just reading the slice length embedded in the fat
    //         pointer and not dereferencing the pointer. The slice might be
    //         uninitialized and there might be outstanding mutable
    //         references to it, hence the cast.
    (&*(ptr.as_ptr() as *const [MaybeUninit<UnsafeCell<T>>])).len()
}

/// Round `addr` up to a multiple of `align`, which must be a power of two.
#[inline]
pub const fn align_up(addr: usize, align: usize) -> Option<usize> {
    match addr.checked_add(align - 1) {
        Some(x) => Some(x & !(align - 1)),
        None => None,
    }
}
