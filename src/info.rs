//! Heap statistics and dumping
use core::ptr::NonNull;

use crate::{block::BLOCK_SIZE, config::Options, heap::Heap, poison};

/// Usage statistics of a [`Heap`], covering every run between the sentinel
/// and the terminator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapInfo {
    pub total_entries: usize,
    pub used_entries: usize,
    pub free_entries: usize,
    pub total_blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    /// The length of the largest free run, in blocks.
    pub max_free_contiguous_blocks: usize,
}

/// A run found by [`Runs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Run {
    pub start: u16,
    pub blocks: u16,
    pub free: bool,
}

/// Iterates over the runs of a heap in address order, excluding the sentinel
/// and the terminator. Stops early at a malformed link.
pub(crate) struct Runs<'a, 'pool, O, R> {
    heap: &'a Heap<'pool, O, R>,
    cur: u16,
}

impl<O, R> Iterator for Runs<'_, '_, O, R> {
    type Item = Run;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.cur;
        if cur == 0 || cur >= self.heap.last() {
            return None;
        }
        let link = self.heap.link(cur);
        let next = link.index();
        self.cur = if next > cur && next <= self.heap.last() {
            next
        } else {
            0
        };
        Some(Run {
            start: cur,
            blocks: next.wrapping_sub(cur),
            free: link.is_free(),
        })
    }
}

impl<'pool, O, R> Heap<'pool, O, R> {
    pub(crate) fn runs(&self) -> Runs<'_, 'pool, O, R> {
        Runs {
            heap: self,
            cur: self.next(0),
        }
    }
}

impl<O: Options, R> Heap<'_, O, R> {
    /// Collect usage statistics.
    pub fn info(&self) -> HeapInfo {
        let mut info = HeapInfo::default();
        for run in self.runs() {
            let blocks = run.blocks as usize;
            info.total_entries += 1;
            info.total_blocks += blocks;
            if run.free {
                info.free_entries += 1;
                info.free_blocks += blocks;
                info.max_free_contiguous_blocks = info.max_free_contiguous_blocks.max(blocks);
            } else {
                info.used_entries += 1;
                info.used_blocks += blocks;
            }
        }
        info
    }

    /// Walk the heap, logging every run at the `info` level if `force` is
    /// set, and check whether `ptr` is in the first block of a free run.
    ///
    /// Returns `ptr` if so, `None` otherwise.
    pub fn dump(&self, ptr: Option<NonNull<u8>>, force: bool) -> Option<NonNull<u8>> {
        let target = ptr.map(|p| {
            let addr = if O::POISON {
                poison::unshift(p)
            } else {
                p.as_ptr() as usize
            };
            self.index_of(addr)
        });

        if force {
            self.log_block(0, 0);
        }

        let mut found = None;
        for run in self.runs() {
            if force {
                self.log_block(run.start, run.blocks);
            }
            if run.free && target == Some(run.start) {
                found = ptr;
            }
        }

        if force {
            let last = self.last();
            self.log_block(last, 0);

            let info = self.info();
            log::info!(
                "Total Entries {:5}    Used Entries {:5}    Free Entries {:5}",
                info.total_entries,
                info.used_entries,
                info.free_entries
            );
            log::info!(
                "Total Blocks  {:5}    Used Blocks  {:5}    Free Blocks  {:5}",
                info.total_blocks,
                info.used_blocks,
                info.free_blocks
            );
            log::info!(
                "Largest free run: {} blocks, {} bytes free",
                info.max_free_contiguous_blocks,
                info.free_blocks * BLOCK_SIZE
            );
        }

        found
    }

    fn log_block(&self, i: u16, blocks: u16) {
        let addr = self.base() + i as usize * BLOCK_SIZE;
        let link = self.link(i);
        if link.is_free() {
            log::info!(
                "|0x{:08x}|B {:5}|NB {:5}|PB {:5}|Z {:5}|NF {:5}|PF {:5}|",
                addr,
                i,
                link.index(),
                self.prev(i),
                blocks,
                self.next_free(i),
                self.prev_free(i)
            );
        } else {
            log::info!(
                "|0x{:08x}|B {:5}|NB {:5}|PB {:5}|Z {:5}|",
                addr,
                i,
                link.index(),
                self.prev(i),
                blocks
            );
        }
    }
}
