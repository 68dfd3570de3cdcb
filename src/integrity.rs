//! Heap consistency checks
use core::fmt;

use crate::{block::run_capacity, config::Options, heap::Heap, poison, poison::PoisonSite};

/// A detected inconsistency in a heap's bookkeeping, or a pointer that
/// doesn't denote a live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// A free list link points outside the allocatable range.
    FreeLinkOutOfRange { block: u16, link: u16 },
    /// `block`'s free list successor `next` doesn't link back to it.
    FreeLinkMismatch { block: u16, next: u16, back: u16 },
    /// A free list member isn't marked free.
    FreeFlagMissing { block: u16 },
    /// The free list doesn't return to the sentinel.
    FreeListCycle,
    /// The sentinel is marked free.
    SentinelFree,
    /// A ring link points past the terminator.
    BlockLinkOutOfRange { block: u16, link: u16 },
    /// A ring link doesn't point forward.
    BlockOrder { block: u16, link: u16 },
    /// `block`'s successor `next` doesn't link back to it.
    BlockLinkMismatch { block: u16, next: u16, back: u16 },
    /// The terminator isn't a used run closing the ring.
    Terminator { link: u16, back: u16 },
    /// Two adjacent runs are both free.
    AdjacentFree { block: u16 },
    /// The number of runs marked free differs from the free list length.
    FreeCountMismatch { listed: usize, flagged: usize },
    /// An allocation's poisoning metadata is damaged.
    Poison { block: u16, site: PoisonSite },
    /// A pointer doesn't denote the start of any run's payload.
    ForeignPointer { addr: usize },
    /// A pointer denotes a free run.
    NotAllocated { block: u16 },
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::FreeLinkOutOfRange { block, link } => {
                write!(f, "free list link {} -> {} is out of range", block, link)
            }
            Self::FreeLinkMismatch { block, next, back } => write!(
                f,
                "free list link {} -> {} is not reciprocated ({} <- {})",
                block, next, back, next
            ),
            Self::FreeFlagMissing { block } => {
                write!(f, "free list member {} is not marked free", block)
            }
            Self::FreeListCycle => f.write_str("free list does not terminate"),
            Self::SentinelFree => f.write_str("sentinel is marked free"),
            Self::BlockLinkOutOfRange { block, link } => {
                write!(f, "block link {} -> {} is out of range", block, link)
            }
            Self::BlockOrder { block, link } => {
                write!(f, "block link {} -> {} does not point forward", block, link)
            }
            Self::BlockLinkMismatch { block, next, back } => write!(
                f,
                "block link {} -> {} is not reciprocated ({} <- {})",
                block, next, back, next
            ),
            Self::Terminator { link, back } => write!(
                f,
                "terminator is broken (next = {}, sentinel prev = {})",
                link, back
            ),
            Self::AdjacentFree { block } => {
                write!(f, "free block {} follows another free block", block)
            }
            Self::FreeCountMismatch { listed, flagged } => write!(
                f,
                "{} blocks are in the free list but {} are marked free",
                listed, flagged
            ),
            Self::Poison { block, site } => {
                write!(f, "poison {} block {} is damaged", site, block)
            }
            Self::ForeignPointer { addr } => {
                write!(f, "0x{:x} is not an allocation of this heap", addr)
            }
            Self::NotAllocated { block } => write!(f, "block {} is not allocated", block),
        }
    }
}

impl<O: Options, R> Heap<'_, O, R> {
    /// Validate the free list and the block ring.
    ///
    /// This doesn't modify the heap. It reads only the blocks it has proven
    /// to be in range.
    pub fn check_integrity(&self) -> Result<(), Corruption> {
        let listed = self.check_free_list()?;
        self.check_ring(listed)
    }

    /// Walk the free list. Returns its length.
    fn check_free_list(&self) -> Result<usize, Corruption> {
        let last = self.last();
        let mut listed = 0usize;
        let mut prev = 0;
        let mut cur = self.next_free(0);

        while cur != 0 {
            if cur >= last {
                return Err(Corruption::FreeLinkOutOfRange {
                    block: prev,
                    link: cur,
                });
            }
            let back = self.prev_free(cur);
            if back != prev {
                return Err(Corruption::FreeLinkMismatch {
                    block: prev,
                    next: cur,
                    back,
                });
            }
            if !self.is_free(cur) {
                return Err(Corruption::FreeFlagMissing { block: cur });
            }

            listed += 1;
            if listed > last as usize {
                return Err(Corruption::FreeListCycle);
            }

            prev = cur;
            cur = self.next_free(cur);
        }

        let back = self.prev_free(0);
        if back != prev {
            return Err(Corruption::FreeLinkMismatch {
                block: prev,
                next: 0,
                back,
            });
        }

        Ok(listed)
    }

    /// Walk the block ring from the sentinel to the terminator.
    fn check_ring(&self, listed: usize) -> Result<(), Corruption> {
        let last = self.last();
        if self.is_free(0) {
            return Err(Corruption::SentinelFree);
        }

        let mut flagged = 0usize;
        let mut prev_free = false;
        let mut prev = 0;
        let mut cur = self.next(0);

        loop {
            if cur > last {
                return Err(Corruption::BlockLinkOutOfRange {
                    block: prev,
                    link: cur,
                });
            }
            // Guarantees termination
            if cur <= prev {
                return Err(Corruption::BlockOrder {
                    block: prev,
                    link: cur,
                });
            }
            let back = self.prev(cur);
            if back != prev {
                return Err(Corruption::BlockLinkMismatch {
                    block: prev,
                    next: cur,
                    back,
                });
            }
            if cur == last {
                break;
            }

            let free = self.is_free(cur);
            if free {
                if prev_free {
                    return Err(Corruption::AdjacentFree { block: cur });
                }
                flagged += 1;
            }

            prev_free = free;
            prev = cur;
            cur = self.next(cur);
        }

        let link = self.link(last);
        let back = self.prev(0);
        if link.index() != 0 || link.is_free() || back != last {
            return Err(Corruption::Terminator {
                link: link.index(),
                back,
            });
        }

        if flagged != listed {
            return Err(Corruption::FreeCountMismatch { listed, flagged });
        }

        Ok(())
    }

    /// Verify the poisoning metadata of every used run.
    ///
    /// Always succeeds if `O` doesn't enable [`Options::POISON`].
    pub fn check_poison(&self) -> Result<(), Corruption> {
        if !O::POISON {
            return Ok(());
        }
        for run in self.runs() {
            if run.free {
                continue;
            }
            let capacity = run_capacity(run.blocks as usize);
            // Safety: `run` is a used run holding `capacity` bytes
            unsafe { poison::check(self.payload(run.start), capacity) }.map_err(|site| {
                Corruption::Poison {
                    block: run.start,
                    site,
                }
            })?;
        }
        Ok(())
    }
}
