//! Block records and index arithmetic
use core::{fmt, mem};

/// The bit of a [`Link`] indicating whether the run it starts is free.
const LINK_FREE: u16 = 0x8000;
/// The bits of a [`Link`] holding a block index.
const LINK_INDEX_MASK: u16 = !LINK_FREE;

/// The maximum number of blocks a heap can be made of.
pub const MAX_BLOCKS: usize = LINK_INDEX_MASK as usize;

/// The size of a block, which is the allocation granularity.
pub const BLOCK_SIZE: usize = mem::size_of::<Block>();

/// The size of the part of a run's first block that is occupied by
/// [`Block::next`] and [`Block::prev`].
pub const HEADER_SIZE: usize = mem::size_of::<Link>() + mem::size_of::<u16>();

/// The number of payload bytes in a single-block run.
pub const BODY_SIZE: usize = BLOCK_SIZE - HEADER_SIZE;

/// The index of the next run start, tagged with the free flag of the run
/// starting at the block holding this link.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct Link(u16);

impl Link {
    #[inline]
    pub const fn new(index: u16, free: bool) -> Self {
        debug_assert!(index <= LINK_INDEX_MASK);
        Self(index | if free { LINK_FREE } else { 0 })
    }

    #[inline]
    pub const fn index(self) -> u16 {
        self.0 & LINK_INDEX_MASK
    }

    #[inline]
    pub const fn is_free(self) -> bool {
        (self.0 & LINK_FREE) != 0
    }

    #[inline]
    pub const fn with_free(self, free: bool) -> Self {
        Self::new(self.index(), free)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_free() {
            write!(f, "{}F", self.index())
        } else {
            write!(f, "{}", self.index())
        }
    }
}

/// A block, the unit of the heap.
///
/// Only the first block of a run carries meaningful `next` and `prev`. The
/// `next_free` and `prev_free` fields are only meaningful on a free run's
/// first block; on a used run they are the first [`BODY_SIZE`] bytes of the
/// payload, and every subsequent block of the run is entirely payload.
#[repr(C, align(4))]
#[derive(Debug)]
pub(crate) struct Block {
    /// The first block of the next run.
    pub next: Link,
    /// The first block of the previous run.
    pub prev: u16,
    pub next_free: u16,
    pub prev_free: u16,
}

/// Get the number of blocks a run must contain to hold `size` bytes.
#[inline]
pub(crate) const fn blocks_needed(size: usize) -> usize {
    if size <= BODY_SIZE {
        1
    } else {
        // The first block contributes `BODY_SIZE` bytes, every following
        // block contributes a whole `BLOCK_SIZE`
        2 + (size - BODY_SIZE - 1) / BLOCK_SIZE
    }
}

/// Get the number of payload bytes an `blocks`-block run can hold.
#[inline]
pub(crate) const fn run_capacity(blocks: usize) -> usize {
    blocks * BLOCK_SIZE - HEADER_SIZE
}
