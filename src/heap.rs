//! The block-index heap
use core::{
    fmt,
    marker::PhantomData,
    mem::{self, MaybeUninit},
    ptr::{self, addr_of, addr_of_mut, NonNull},
};

use crate::{
    block::{blocks_needed, run_capacity, Block, Link, BLOCK_SIZE, HEADER_SIZE, MAX_BLOCKS},
    config::{DefaultOptions, Fit, InitError, Options},
    integrity::Corruption,
    poison,
    telemetry::{NoRecorder, Op, Recorder},
    utils::{align_up, nonnull_slice_len},
};

mod splice;

#[doc = svgbobdoc::transform!(
/// A heap allocator managing a single memory region as an array of 8-byte
/// blocks addressed by 15-bit indices.
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///                 next (ring)
///    ,-------------------------------------------------------------,
///    |     ,---------------,     ,---------------,     ,-------,   |
///    v     |               v     |               v     |       v   |
///  +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
///  | 0 | 1 :   :   :   : 5 : 6 |   :   :   | 9 :   :   : 12| 13|   |
///  +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---'
///    |   '------ used -----'   '--- free --'   '--- used --'   |
///    |                           ^     |                       |
///    |  next_free / prev_free    |     |                       |
///    '---------------------------'<----'                 terminator
///  sentinel
/// ```
/// </center>
///
/// Block 0 is a sentinel anchoring the address-ordered ring of runs and the
/// circular free list. The last block is a permanently used terminator.
/// Every other block belongs to exactly one run. A run of `n` blocks holds
/// `n * 8 - 4` bytes: the first four bytes of its first block store the
/// links to the neighboring runs, and the rest is payload (or, for a free
/// run, the free list links).
///
/// # Properties
///
/// Returned pointers are aligned to 4 bytes. The region can hold at most
/// [`MAX_BLOCKS`] blocks; anything beyond is left unused.
///
/// Allocation and resizing take time linear in the length of the free list.
/// Deallocation takes constant time. Every operation takes linear time in
/// the number of runs if `O` enables [`Options::INTEGRITY_CHECK`] or
/// [`Options::POISON`].
)]
pub struct Heap<'pool, O = DefaultOptions, R = NoRecorder> {
    blocks: NonNull<Block>,
    num_blocks: u16,
    on_corruption: fn(),
    recorder: R,
    _phantom: PhantomData<(&'pool mut (), fn() -> O)>,
}

// Safety: All memory block headers directly or indirectly referenced by a
//         particular instance of `Heap` are logically owned by that `Heap`
//         and have no interior mutability, so these are safe.
unsafe impl<O, R: Send> Send for Heap<'_, O, R> {}
unsafe impl<O, R: Sync> Sync for Heap<'_, O, R> {}

impl<O, R> fmt::Debug for Heap<'_, O, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("blocks", &self.blocks)
            .field("num_blocks", &self.num_blocks)
            .finish()
    }
}

fn default_corruption_handler() {
    panic!("heap corruption detected");
}

impl<'pool, O: Options, R: Recorder + Default> Heap<'pool, O, R> {
    /// Construct a `Heap` managing `pool`.
    ///
    /// # Examples
    ///
    /// ```
    /// use bixheap::Heap;
    /// use std::mem::MaybeUninit;
    ///
    /// let mut pool = [MaybeUninit::uninit(); 1024];
    /// let mut heap: Heap = Heap::new(&mut pool).unwrap();
    ///
    /// let ptr = heap.allocate(10).unwrap();
    /// unsafe { heap.release(Some(ptr)) };
    /// ```
    pub fn new(pool: &'pool mut [MaybeUninit<u8>]) -> Result<Self, InitError> {
        Self::with_recorder(pool, R::default())
    }
}

impl<'pool, O: Options, R: Recorder> Heap<'pool, O, R> {
    /// Construct a `Heap` managing `pool`, reporting successful operations
    /// to `recorder`.
    pub fn with_recorder(
        pool: &'pool mut [MaybeUninit<u8>],
        recorder: R,
    ) -> Result<Self, InitError> {
        let len = pool.len();
        // Safety: `pool` is a valid, exclusively borrowed region of `len`
        //         bytes that outlives `'pool`
        unsafe {
            Self::from_raw_parts(
                NonNull::new_unchecked(pool.as_mut_ptr().cast()),
                len,
                recorder,
            )
        }
    }

    /// Construct a `Heap` managing the memory region `pool`.
    ///
    /// # Safety
    ///
    /// The memory block will be considered owned by `self`. The memory block
    /// must outlive `'pool`.
    pub unsafe fn from_ptr(pool: NonNull<[u8]>, recorder: R) -> Result<Self, InitError> {
        let len = nonnull_slice_len(pool);
        Self::from_raw_parts(pool.cast(), len, recorder)
    }

    /// Construct a `Heap` managing the `len`-byte memory region starting at
    /// `base`.
    ///
    /// `base` is rounded up to the block alignment (4 bytes), and the bytes
    /// past the last whole block are left unused.
    ///
    /// # Safety
    ///
    /// The memory block will be considered owned by `self`. The memory block
    /// must outlive `'pool`.
    pub unsafe fn from_raw_parts(
        base: NonNull<u8>,
        len: usize,
        recorder: R,
    ) -> Result<Self, InitError> {
        let start = base.as_ptr() as usize;
        let aligned = align_up(start, mem::align_of::<Block>()).ok_or(InitError::TooSmall { len })?;
        let usable = len
            .checked_sub(aligned - start)
            .ok_or(InitError::TooSmall { len })?;
        let num_blocks = (usable / BLOCK_SIZE).min(MAX_BLOCKS);
        if num_blocks < 3 {
            return Err(InitError::TooSmall { len });
        }

        let mut this = Self {
            blocks: NonNull::new_unchecked(base.as_ptr().add(aligned - start).cast()),
            num_blocks: num_blocks as u16,
            on_corruption: default_corruption_handler,
            recorder,
            _phantom: PhantomData,
        };
        this.format();

        log::debug!(
            "heap at {:p}: {} blocks, {} bytes free",
            this.blocks,
            num_blocks,
            this.free_bytes_remaining()
        );

        Ok(this)
    }

    /// Lay out the sentinel, one free run covering everything in between,
    /// and the terminator.
    fn format(&mut self) {
        let last = self.num_blocks - 1;

        self.set_link(0, Link::new(1, false));
        self.set_prev(0, last);
        self.set_next_free(0, 1);
        self.set_prev_free(0, 1);

        self.set_link(1, Link::new(last, true));
        self.set_prev(1, 0);
        self.set_next_free(1, 0);
        self.set_prev_free(1, 0);

        self.set_link(last, Link::new(0, false));
        self.set_prev(last, 1);
    }

    /// Replace the function called after a corruption has been detected and
    /// logged. The default handler panics.
    ///
    /// The handler runs before the offending operation returns. It must not
    /// use this heap.
    #[inline]
    pub fn set_corruption_handler(&mut self, handler: fn()) {
        self.on_corruption = handler;
    }

    /// Get a reference to the recorder.
    #[inline]
    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    /// Get a mutable reference to the recorder.
    #[inline]
    pub fn recorder_mut(&mut self) -> &mut R {
        &mut self.recorder
    }

    /// Get the number of blocks, including the sentinel and the terminator.
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.num_blocks as usize
    }

    /// Attempt to allocate `size` bytes.
    ///
    /// Returns `None` if `size` is zero, if no free run is large enough, or if
    /// a corruption was detected.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.allocate_unrecorded(size)?;
        self.record(Op::Allocate, size, ptr);
        Some(ptr)
    }

    /// Attempt to allocate `count * size` zero-filled bytes.
    ///
    /// Returns `None` if the product overflows, in addition to the cases
    /// [`Self::allocate`] returns `None`.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = match count.checked_mul(size) {
            Some(total) => total,
            None => {
                log::debug!("allocate_zeroed({}, {}): size overflow", count, size);
                return None;
            }
        };
        let ptr = self.allocate_unrecorded(total)?;
        // Safety: `ptr` is writable for `total` bytes
        unsafe { ptr.as_ptr().write_bytes(0, total) };
        self.record(Op::Allocate, total, ptr);
        Some(ptr)
    }

    fn allocate_unrecorded(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        if !self.precheck() {
            return None;
        }

        let raw_size = if O::POISON {
            poison::poisoned_size(size)?
        } else {
            size
        };

        let ptr = match self.alloc_blocks(blocks_needed(raw_size)) {
            Some(c) => self.payload(c),
            None => {
                log::debug!("allocate({}): out of memory", size);
                return None;
            }
        };

        let ptr = if O::POISON {
            // Safety: The run holds at least `raw_size` bytes
            unsafe { poison::put(ptr, raw_size) }
        } else {
            ptr
        };
        log::trace!("allocate({}) = {:p}", size, ptr);
        Some(ptr)
    }

    /// Release an allocation. `None` is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a memory block previously allocated by `self` and
    /// not released since.
    pub unsafe fn release(&mut self, ptr: Option<NonNull<u8>>) {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return,
        };
        if let Some(c) = self.checked_block(ptr) {
            self.free_block(c);
            log::trace!("release({:p})", ptr);
            self.record(Op::Release, 0, ptr);
        }
    }

    /// Change the size of an allocation, moving it if necessary.
    ///
    /// `None` behaves like [`Self::allocate`]. A zero `size` releases the
    /// allocation and returns `None`. The first `min(old, size)` bytes are
    /// preserved. On failure, `None` is returned and the original allocation
    /// remains valid and unchanged.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a memory block previously allocated by `self` and
    /// not released since.
    pub unsafe fn resize(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return self.allocate(size),
        };
        if size == 0 {
            self.release(Some(ptr));
            return None;
        }

        let c = self.checked_block(ptr)?;

        let raw_size = if O::POISON {
            poison::poisoned_size(size)?
        } else {
            size
        };

        let new_ptr = match self.resize_run(c, raw_size) {
            Some(p) => p,
            None => {
                log::debug!("resize({:p}, {}): out of memory", ptr, size);
                return None;
            }
        };

        let new_ptr = if O::POISON {
            // The trailing canary moves with the size
            poison::put(new_ptr, raw_size)
        } else {
            new_ptr
        };
        log::trace!("resize({:p}, {}) = {:p}", ptr, size, new_ptr);
        self.record(Op::Resize, size, new_ptr);
        Some(new_ptr)
    }

    /// Get the number of bytes in free blocks.
    #[inline]
    pub fn free_bytes_remaining(&self) -> usize {
        self.info().free_blocks * BLOCK_SIZE
    }

    fn record(&mut self, op: Op, size: usize, ptr: NonNull<u8>) {
        let free_bytes = self
            .recorder
            .wants_free_bytes()
            .then(|| self.free_bytes_remaining());
        self.recorder
            .record(op, size, ptr.as_ptr() as usize, free_bytes);
    }

    /// Run the enabled checks before a mutating operation.
    fn precheck(&self) -> bool {
        if O::INTEGRITY_CHECK {
            if let Err(e) = self.check_integrity() {
                self.report(e);
                return false;
            }
        }
        if O::POISON {
            if let Err(e) = self.check_poison() {
                self.report(e);
                return false;
            }
        }
        true
    }

    /// Run the enabled checks for an operation on the allocation `user`, and
    /// get its run.
    fn checked_block(&self, user: NonNull<u8>) -> Option<u16> {
        if O::INTEGRITY_CHECK {
            if let Err(e) = self.check_integrity() {
                self.report(e);
                return None;
            }
        }
        let c = match self.resolve(user) {
            Ok(c) => c,
            Err(e) => {
                self.report(e);
                return None;
            }
        };
        if O::POISON {
            if let Err(e) = self.check_poison() {
                self.report(e);
                return None;
            }
        }
        Some(c)
    }

    #[cold]
    fn report(&self, corruption: Corruption) {
        log::error!("heap corruption: {}", corruption);
        (self.on_corruption)();
    }

    /// Get the run a user pointer belongs to.
    ///
    /// If no checks are enabled, `user` is trusted blindly.
    fn resolve(&self, user: NonNull<u8>) -> Result<u16, Corruption> {
        let addr = if O::POISON {
            poison::unshift(user)
        } else {
            user.as_ptr() as usize
        };

        if !O::POISON && !O::INTEGRITY_CHECK {
            return Ok(self.index_of(addr));
        }

        let c = self.locate(addr)?;

        if O::POISON {
            let capacity = run_capacity(self.run_len(c) as usize);
            // Safety: `c` is a used run holding `capacity` bytes
            unsafe { poison::check(self.payload(c), capacity) }
                .map_err(|site| Corruption::Poison { block: c, site })?;
        }

        Ok(c)
    }

    /// Find the used run whose payload starts at `addr`.
    fn locate(&self, addr: usize) -> Result<u16, Corruption> {
        let foreign = Corruption::ForeignPointer { addr };
        let offset = addr.wrapping_sub(self.base() + HEADER_SIZE);
        if offset % BLOCK_SIZE != 0 {
            return Err(foreign);
        }
        let c = offset / BLOCK_SIZE;
        if c == 0 || c >= self.num_blocks as usize - 1 {
            return Err(foreign);
        }
        let c = c as u16;

        // `c` must be a run start, i.e., linked from both of its neighbors
        let (p, n) = (self.prev(c), self.next(c));
        if p >= c || self.next(p) != c || n <= c || n >= self.num_blocks || self.prev(n) != c {
            return Err(foreign);
        }

        if self.is_free(c) {
            return Err(Corruption::NotAllocated { block: c });
        }

        Ok(c)
    }

    /// Take a run of `blocks` blocks off the free list.
    fn alloc_blocks(&mut self, blocks: usize) -> Option<u16> {
        if blocks >= self.num_blocks as usize {
            return None;
        }

        let mut found: Option<(u16, usize)> = None;
        let mut cf = self.next_free(0);
        while cf != 0 {
            let len = self.run_len(cf) as usize;
            if len >= blocks {
                match O::FIT {
                    Fit::First => {
                        found = Some((cf, len));
                        break;
                    }
                    Fit::Best => {
                        if found.map_or(true, |(_, best)| len < best) {
                            found = Some((cf, len));
                            if len == blocks {
                                break;
                            }
                        }
                    }
                }
            }
            cf = self.next_free(cf);
        }

        let (cf, len) = found?;
        if len == blocks {
            self.unlink(cf);
        } else {
            // The remainder takes over `cf`'s position in the free list
            let (prev_free, next_free) = (self.prev_free(cf), self.next_free(cf));
            self.split(cf, blocks as u16, false, true);
            self.link_between(cf + blocks as u16, prev_free, next_free);
        }

        Some(cf)
    }

    /// Return the used run `c` to the free list, coalescing it with its free
    /// neighbors.
    fn free_block(&mut self, c: u16) {
        self.assimilate_up(c);
        if self.is_free(self.prev(c)) {
            self.assimilate_down(c, true);
        } else {
            self.link_at_head(c);
        }
    }

    /// Resize the used run `c` to hold `size` bytes. Returns the new payload.
    ///
    /// On failure, `c` is left exactly as it was.
    unsafe fn resize_run(&mut self, c: u16, size: usize) -> Option<NonNull<u8>> {
        let blocks = blocks_needed(size);
        let old_blocks = self.run_len(c) as usize;
        if blocks == old_blocks {
            return Some(self.payload(c));
        }
        if blocks >= self.num_blocks as usize {
            return None;
        }

        let old_size = run_capacity(old_blocks);
        let mut c = c;

        // The free list position of the next run, in case it has to be
        // given back
        let next = self.next(c);
        let slot = self
            .is_free(next)
            .then(|| (self.prev_free(next), self.next_free(next)));
        self.assimilate_up(c);

        if (self.run_len(c) as usize) < blocks {
            let p = self.prev(c);
            if self.is_free(p) && ((self.next(c) - p) as usize) >= blocks {
                self.unlink(p);
                let src = self.payload(c);
                c = self.assimilate_down(c, false);
                ptr::copy(src.as_ptr(), self.payload(c).as_ptr(), old_size);
            }
        }

        let len = self.run_len(c) as usize;
        if len > blocks {
            self.split(c, blocks as u16, false, false);
            self.free_block(c + blocks as u16);
        } else if len < blocks {
            return match self.alloc_blocks(blocks) {
                Some(new) => {
                    let new = self.payload(new);
                    ptr::copy_nonoverlapping(self.payload(c).as_ptr(), new.as_ptr(), old_size);
                    self.free_block(c);
                    Some(new)
                }
                None => {
                    // Give back whatever `assimilate_up` took
                    if let Some((prev_free, next_free)) = slot {
                        self.split(c, old_blocks as u16, false, true);
                        self.link_between(next, prev_free, next_free);
                    }
                    None
                }
            };
        }

        Some(self.payload(c))
    }
}

/// Block accessors. `i` must be in range; this only holds for indices read
/// from the heap as long as the heap isn't corrupted.
impl<O, R> Heap<'_, O, R> {
    #[inline]
    pub(crate) fn base(&self) -> usize {
        self.blocks.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn last(&self) -> u16 {
        self.num_blocks - 1
    }

    #[inline]
    fn ptr(&self, i: u16) -> *mut Block {
        debug_assert!(i < self.num_blocks, "block {} out of range", i);
        // Safety: `i` is in range
        unsafe { self.blocks.as_ptr().add(i as usize) }
    }

    #[inline]
    pub(crate) fn link(&self, i: u16) -> Link {
        // Safety: `i` is in range
        unsafe { addr_of!((*self.ptr(i)).next).read() }
    }

    #[inline]
    pub(crate) fn set_link(&mut self, i: u16, link: Link) {
        // Safety: `i` is in range
        unsafe { addr_of_mut!((*self.ptr(i)).next).write(link) }
    }

    #[inline]
    pub(crate) fn next(&self, i: u16) -> u16 {
        self.link(i).index()
    }

    #[inline]
    pub(crate) fn is_free(&self, i: u16) -> bool {
        self.link(i).is_free()
    }

    #[inline]
    pub(crate) fn prev(&self, i: u16) -> u16 {
        // Safety: `i` is in range
        unsafe { addr_of!((*self.ptr(i)).prev).read() }
    }

    #[inline]
    pub(crate) fn set_prev(&mut self, i: u16, prev: u16) {
        // Safety: `i` is in range
        unsafe { addr_of_mut!((*self.ptr(i)).prev).write(prev) }
    }

    #[inline]
    pub(crate) fn next_free(&self, i: u16) -> u16 {
        // Safety: `i` is in range
        unsafe { addr_of!((*self.ptr(i)).next_free).read() }
    }

    #[inline]
    pub(crate) fn set_next_free(&mut self, i: u16, next_free: u16) {
        // Safety: `i` is in range
        unsafe { addr_of_mut!((*self.ptr(i)).next_free).write(next_free) }
    }

    #[inline]
    pub(crate) fn prev_free(&self, i: u16) -> u16 {
        // Safety: `i` is in range
        unsafe { addr_of!((*self.ptr(i)).prev_free).read() }
    }

    #[inline]
    pub(crate) fn set_prev_free(&mut self, i: u16, prev_free: u16) {
        // Safety: `i` is in range
        unsafe { addr_of_mut!((*self.ptr(i)).prev_free).write(prev_free) }
    }

    /// Get the payload of the run starting at `i`.
    #[inline]
    pub(crate) fn payload(&self, i: u16) -> NonNull<u8> {
        // Safety: `i` is in range, so the pointer is non-null
        unsafe { NonNull::new_unchecked(addr_of_mut!((*self.ptr(i)).next_free).cast()) }
    }

    /// Get the number of blocks in the run starting at `i`.
    #[inline]
    pub(crate) fn run_len(&self, i: u16) -> u16 {
        self.next(i).wrapping_sub(i)
    }

    /// Get the index of the block containing `addr`.
    #[inline]
    pub(crate) fn index_of(&self, addr: usize) -> u16 {
        (addr.wrapping_sub(self.base()) / BLOCK_SIZE) as u16
    }
}
