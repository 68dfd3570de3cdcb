extern crate std;

use std::{collections::BTreeMap, ops::Range, ptr::NonNull};

/// Tracks which byte ranges have been handed out, and panics on overlapping
/// allocations or releases of free memory.
pub struct ShadowAllocator {
    regions: BTreeMap<usize, SaRegion>,
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SaRegion {
    Free,
    Used,
    Invalid,
}

impl ShadowAllocator {
    pub fn new() -> Self {
        Self {
            regions: Some((0, SaRegion::Invalid)).into_iter().collect(),
        }
    }

    /// Mark `range` as `to`. All of it must currently be `from`.
    pub fn convert_range(&mut self, range: Range<usize>, from: SaRegion, to: SaRegion) {
        if range.is_empty() {
            return;
        }
        assert_ne!(from, to);
        log::trace!("sa: {:?}: {:?} -> {:?}", range, from, to);

        // The entry covering the last byte must also cover the first
        let (&start, &state) = self
            .regions
            .range(..range.end)
            .next_back()
            .expect("entry at address 0");
        assert!(
            start <= range.start,
            "{:?} spans more than one region (one starts at 0x{:x})",
            range,
            start
        );
        assert_eq!(state, from, "{:?} has the wrong state", range);

        if !self.regions.contains_key(&range.end) {
            self.regions.insert(range.end, from);
        }
        self.regions.insert(range.start, to);

        // Merge with equal neighbors so that entries stay boundaries
        if self.regions.get(&range.end) == Some(&to) {
            self.regions.remove(&range.end);
        }
        let before = self.regions.range(..range.start).next_back().map(|(_, &s)| s);
        if before == Some(to) {
            self.regions.remove(&range.start);
        }
    }

    pub fn insert_free_block<T>(&mut self, range: *const [T]) {
        let start = range as *const T as usize;
        let len = unsafe { &*range }.len() * std::mem::size_of::<T>();
        self.convert_range(start..start + len, SaRegion::Invalid, SaRegion::Free);
    }

    pub fn allocate(&mut self, size: usize, start: NonNull<u8>) {
        let start = start.as_ptr() as usize;
        assert!(
            start % 4 == 0,
            "0x{:x} is not properly aligned (4 bytes alignment required)",
            start
        );
        self.convert_range(start..start + size, SaRegion::Free, SaRegion::Used);
    }

    pub fn deallocate(&mut self, size: usize, start: NonNull<u8>) {
        let start = start.as_ptr() as usize;
        self.convert_range(start..start + size, SaRegion::Used, SaRegion::Free);
    }
}
