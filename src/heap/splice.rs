//! Ring and free list manipulation
use super::Heap;
use crate::block::Link;

impl<O, R> Heap<'_, O, R> {
    /// Insert the run `c` at the head of the free list and mark it free.
    pub(super) fn link_at_head(&mut self, c: u16) {
        let head = self.next_free(0);
        self.link_between(c, 0, head);
    }

    /// Insert the run `c` into the free list between `prev_free` and
    /// `next_free`, which must be adjacent in it, and mark it free.
    pub(super) fn link_between(&mut self, c: u16, prev_free: u16, next_free: u16) {
        self.set_next_free(c, next_free);
        self.set_prev_free(c, prev_free);
        self.set_prev_free(next_free, c);
        self.set_next_free(prev_free, c);
        self.set_link(c, self.link(c).with_free(true));
    }

    /// Remove the run `c` from the free list and mark it used.
    pub(super) fn unlink(&mut self, c: u16) {
        let (next_free, prev_free) = (self.next_free(c), self.prev_free(c));
        self.set_next_free(prev_free, next_free);
        self.set_prev_free(next_free, prev_free);
        self.set_link(c, self.link(c).with_free(false));
    }

    /// Split the run `c` so that a new run starts at `c + blocks`.
    ///
    /// Only the ring is updated. Inserting either part into the free list is
    /// the caller's responsibility.
    pub(super) fn split(&mut self, c: u16, blocks: u16, cur_free: bool, new_free: bool) {
        let new = c + blocks;
        let next = self.next(c);
        debug_assert!(new < next, "split({}, {}) overruns {}", c, blocks, next);

        self.set_link(new, Link::new(next, new_free));
        self.set_prev(new, c);
        self.set_prev(next, new);
        self.set_link(c, Link::new(new, cur_free));
    }

    /// Absorb the next run into `c` if it's free. `c`'s free flag is
    /// preserved.
    pub(super) fn assimilate_up(&mut self, c: u16) -> bool {
        let next = self.next(c);
        if !self.is_free(next) {
            return false;
        }

        log::trace!("assimilate_up({}): absorbing {}", c, next);
        self.unlink(next);
        let after = self.next(next);
        self.set_prev(after, c);
        self.set_link(c, Link::new(after, self.is_free(c)));
        true
    }

    /// Merge `c` into the previous run, which takes the free flag `free`.
    /// Returns the previous run.
    ///
    /// The free list is left untouched.
    pub(super) fn assimilate_down(&mut self, c: u16, free: bool) -> u16 {
        let prev = self.prev(c);
        let next = self.next(c);
        log::trace!("assimilate_down({}): into {}", c, prev);
        self.set_link(prev, Link::new(next, free));
        self.set_prev(next, prev);
        prev
    }
}
