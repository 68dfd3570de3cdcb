//! Allocation poisoning
//!
//! A poisoned allocation is laid out as follows:
//!
//! ```text
//! | total length: u32 | 4 × POISON_BYTE | user data ... | 4 × POISON_BYTE |
//! ^ run payload                          ^ returned pointer
//! ```
//!
//! The total length covers all four parts, so the trailing canary can be
//! located without knowing the user size.
use core::{fmt, mem, ptr::NonNull};

pub(crate) const POISON_BYTE: u8 = 0xa5;

const POISON_SIZE_BEFORE: usize = 4;
const POISON_SIZE_AFTER: usize = 4;

type PoisonedLen = u32;

const LEN_SIZE: usize = mem::size_of::<PoisonedLen>();

/// The offset of the user pointer from the run payload.
pub(crate) const POISON_OFFSET: usize = LEN_SIZE + POISON_SIZE_BEFORE;

/// The number of extra bytes a poisoned allocation consumes.
pub(crate) const POISON_OVERHEAD: usize = POISON_OFFSET + POISON_SIZE_AFTER;

/// Which part of a poisoned allocation was found damaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonSite {
    /// The stored length doesn't fit in the run.
    Length,
    /// The canary preceding the user data.
    Before,
    /// The canary following the user data.
    After,
}

impl fmt::Display for PoisonSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Length => "length",
            Self::Before => "before",
            Self::After => "after",
        })
    }
}

/// Get the size to request from the core allocator for a `size`-byte
/// poisoned allocation.
#[inline]
pub(crate) fn poisoned_size(size: usize) -> Option<usize> {
    size.checked_add(POISON_OVERHEAD)
        .filter(|&x| x <= PoisonedLen::MAX as usize)
}

/// Write the length header and canaries into a fresh run payload, and return
/// the user pointer.
///
/// # Safety
///
/// `payload` must be writable for `size_w_poison` bytes, and `size_w_poison`
/// must be a value returned by [`poisoned_size`].
pub(crate) unsafe fn put(payload: NonNull<u8>, size_w_poison: usize) -> NonNull<u8> {
    let p = payload.as_ptr();
    p.cast::<PoisonedLen>()
        .write_unaligned(size_w_poison as PoisonedLen);
    p.add(LEN_SIZE).write_bytes(POISON_BYTE, POISON_SIZE_BEFORE);
    p.add(size_w_poison - POISON_SIZE_AFTER)
        .write_bytes(POISON_BYTE, POISON_SIZE_AFTER);
    NonNull::new_unchecked(p.add(POISON_OFFSET))
}

/// Get the run payload address for a user pointer.
#[inline]
pub(crate) fn unshift(user: NonNull<u8>) -> usize {
    (user.as_ptr() as usize).wrapping_sub(POISON_OFFSET)
}

/// Verify the header and both canaries of a poisoned allocation.
///
/// # Safety
///
/// `payload` must be readable for `capacity` bytes.
pub(crate) unsafe fn check(payload: NonNull<u8>, capacity: usize) -> Result<(), PoisonSite> {
    let p = payload.as_ptr();
    let len = p.cast::<PoisonedLen>().read_unaligned() as usize;
    if len < POISON_OVERHEAD || len > capacity {
        log::error!(
            "poisoned length {} at {:p} doesn't fit in {} bytes",
            len,
            p,
            capacity
        );
        return Err(PoisonSite::Length);
    }

    check_canary(p.add(LEN_SIZE), POISON_SIZE_BEFORE, PoisonSite::Before)?;
    check_canary(
        p.add(len - POISON_SIZE_AFTER),
        POISON_SIZE_AFTER,
        PoisonSite::After,
    )
}

unsafe fn check_canary(p: *const u8, len: usize, site: PoisonSite) -> Result<(), PoisonSite> {
    let bytes = core::slice::from_raw_parts(p, len);
    if bytes.iter().all(|&b| b == POISON_BYTE) {
        Ok(())
    } else {
        log::error!(
            "there is no poison {} the block. Expected poison address: {:p}, actual data: {:02x?}",
            site,
            p,
            bytes
        );
        Err(site)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(4))]
    struct Buf([u8; 32]);

    #[test]
    fn put_then_check() {
        let mut buf = Buf([0; 32]);
        let payload = NonNull::new(buf.0.as_mut_ptr()).unwrap();
        let size = poisoned_size(10).unwrap();
        let user = unsafe { put(payload, size) };
        assert_eq!(user.as_ptr() as usize - payload.as_ptr() as usize, POISON_OFFSET);
        assert_eq!(unshift(user), payload.as_ptr() as usize);
        assert_eq!(unsafe { check(payload, 32) }, Ok(()));
    }

    #[test]
    fn damaged_canaries() {
        let mut buf = Buf([0; 32]);
        let payload = NonNull::new(buf.0.as_mut_ptr()).unwrap();
        let size = poisoned_size(10).unwrap();
        unsafe { put(payload, size) };

        let p = payload.as_ptr();
        unsafe { p.add(POISON_OFFSET - 1).write(0) };
        assert_eq!(unsafe { check(payload, 32) }, Err(PoisonSite::Before));
        unsafe { p.add(POISON_OFFSET - 1).write(POISON_BYTE) };

        unsafe { *p.add(POISON_OFFSET + 10) ^= 1 };
        assert_eq!(unsafe { check(payload, 32) }, Err(PoisonSite::After));
        unsafe { p.add(POISON_OFFSET + 10).write(POISON_BYTE) };

        assert_eq!(unsafe { check(payload, size - 1) }, Err(PoisonSite::Length));
        assert_eq!(unsafe { check(payload, size) }, Ok(()));
    }
}
