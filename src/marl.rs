//! The allocator core: one [`Marl`] value owns a heap.
//!
//! [`Marl`] is plain state plus `&mut self` methods; it has no interior
//! mutability and therefore no locking. Wrap it in
//! [`MarlLock`](crate::MarlLock) to share it between threads or to use it as
//! a global allocator.
//!
//! The design is the classic boundary-tag/segregated-fit one: freed chunks
//! carry their size at both ends so physical neighbors merge in O(1), small
//! recently-freed chunks short-circuit through LIFO fast bins, everything
//! else stages through the unsorted queue before landing in one of 126
//! size-classed bins, and the wilderness chunk at the frontier (`top`) grows
//! and shrinks against the system source.

use core::ptr::{self, NonNull};

use allocator_api2::alloc::AllocError;

use crate::bins::{
    bin_index, fastbin_index, in_smallbin_range, largebin_index, smallbin_index, BinMap,
    DEFAULT_MAX_FAST, MAX_FAST_CEILING, NBINS, NFASTBINS, UNSORTED_BIN,
};
use crate::chunk::{
    request_to_chunk_size, Chunk, ALIGN_MASK, MALLOC_ALIGN, MIN_CHUNK_SIZE, MMAPPED, PREV_IN_USE,
    WORD_SIZE,
};
use crate::llist::LlistNode;
use crate::ptr_utils;
use crate::system::SystemSource;

const DEFAULT_TRIM_THRESHOLD: usize = 128 * 1024;
const DEFAULT_TOP_PAD: usize = 0;
const DEFAULT_MMAP_THRESHOLD: usize = 128 * 1024;
const DEFAULT_MMAP_MAX: usize = 65536;

/// Freeing a chunk this large (after coalescing) is taken as a hint that
/// fast-bin residue is worth collapsing, and that top may be worth trimming.
const FASTBIN_CONSOLIDATION_THRESHOLD: usize = DEFAULT_TRIM_THRESHOLD / 2;

/// Unit for the one-shot mapping fallback when the break cannot move.
const MMAP_AS_SBRK_UNIT: usize = 1 << 20;

// The two low bits of `max_fast` are repurposed as state flags: the bound is
// a multiple of MALLOC_ALIGN so they are always free.
const ANYCHUNKS_BIT: usize = 1;
const FASTCHUNKS_BIT: usize = 2;
const MAX_FAST_FLAGS: usize = ANYCHUNKS_BIT | FASTCHUNKS_BIT;

// Fenceposts are two-word pseudo-chunks: big enough to carry a head, small
// enough that any retiring top can hold a pair of them.
const FENCE_SIZE: usize = 2 * WORD_SIZE;

/// Runtime-adjustable parameters, applied through [`Marl::tune`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tunable {
    /// Chunk-size bound for fast-bin eligibility, given as a request size.
    /// Zero disables the fast bins. Bounded by
    /// [`MAX_FAST_CEILING`](crate::MAX_FAST_CEILING).
    MaxFast,
    /// Top size beyond which automatic trimming kicks in.
    TrimThreshold,
    /// Extra slack requested on every heap extension.
    TopPad,
    /// Request size at which allocations go to direct mappings.
    MmapThreshold,
    /// Maximum number of simultaneous direct mappings.
    MmapMax,
}

/// The allocator.
///
/// `S` supplies system memory; see [`SystemSource`](crate::SystemSource).
/// A fresh `Marl` owns nothing — the first allocation acquires the bin
/// metadata and the initial heap from the source.
pub struct Marl<S: SystemSource> {
    pub(crate) system: S,

    /// `NBINS` list sentinels in a dedicated metadata block; null until the
    /// first allocation establishes it.
    pub(crate) bins: *mut LlistNode,
    pub(crate) binmap: BinMap,
    /// Singly-linked LIFO stacks of recently freed small chunks.
    pub(crate) fastbins: [*mut u8; NFASTBINS],

    /// The wilderness chunk bordering the frontier; never binned.
    pub(crate) top: *mut u8,
    /// Locality hint: the most recent remainder split off for a small request.
    pub(crate) last_remainder: *mut u8,

    /// Fast-bin size bound, with `ANYCHUNKS`/`FASTCHUNKS` in the low bits.
    pub(crate) max_fast: usize,
    pub(crate) trim_threshold: usize,
    pub(crate) top_pad: usize,
    pub(crate) mmap_threshold: usize,
    pub(crate) n_mmaps_max: usize,

    pub(crate) pagesize: usize,
    /// Whether break extensions have so far always adjoined the old frontier.
    pub(crate) contiguous: bool,

    pub(crate) n_mmaps: usize,
    pub(crate) sbrked_mem: usize,
    pub(crate) max_sbrked_mem: usize,
    pub(crate) mmapped_mem: usize,
    pub(crate) max_mmapped_mem: usize,
    pub(crate) max_total_mem: usize,
}

unsafe impl<S: SystemSource + Send> Send for Marl<S> {}

impl<S: SystemSource> core::fmt::Debug for Marl<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Marl")
            .field("bins", &self.bins)
            .field("binmap", &self.binmap)
            .field("top", &self.top)
            .field("max_fast", &format_args!("{:#x}", self.max_fast))
            .field("contiguous", &self.contiguous)
            .field("sbrked_mem", &self.sbrked_mem)
            .field("mmapped_mem", &self.mmapped_mem)
            .finish_non_exhaustive()
    }
}

impl<S: SystemSource> Marl<S> {
    /// Create an allocator over `system`, with default tunables.
    ///
    /// No memory is touched until the first allocation.
    pub const fn new(system: S) -> Self {
        Self {
            system,
            bins: ptr::null_mut(),
            binmap: BinMap::new(),
            fastbins: [ptr::null_mut(); NFASTBINS],
            top: ptr::null_mut(),
            last_remainder: ptr::null_mut(),
            max_fast: DEFAULT_MAX_FAST,
            trim_threshold: DEFAULT_TRIM_THRESHOLD,
            top_pad: DEFAULT_TOP_PAD,
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
            n_mmaps_max: DEFAULT_MMAP_MAX,
            pagesize: 0,
            contiguous: true,
            n_mmaps: 0,
            sbrked_mem: 0,
            max_sbrked_mem: 0,
            mmapped_mem: 0,
            max_mmapped_mem: 0,
            max_total_mem: 0,
        }
    }

    #[inline]
    fn get_max_fast(&self) -> usize {
        self.max_fast & !MAX_FAST_FLAGS
    }

    #[inline]
    fn have_fastchunks(&self) -> bool {
        self.max_fast & FASTCHUNKS_BIT != 0
    }

    #[inline]
    fn have_anychunks(&self) -> bool {
        self.max_fast & ANYCHUNKS_BIT != 0
    }

    #[inline]
    pub(crate) fn bin_at(&self, index: usize) -> *mut LlistNode {
        debug_assert!(!self.bins.is_null() && index < NBINS);
        self.bins.wrapping_add(index)
    }

    #[inline]
    pub(crate) fn top_chunk(&self) -> Option<Chunk> {
        if self.top.is_null() { None } else { Some(Chunk(self.top)) }
    }

    #[inline]
    unsafe fn top_size(&self) -> usize {
        match self.top_chunk() {
            Some(top) => top.size(),
            None => 0,
        }
    }

    #[inline]
    fn page_align(&self, size: usize) -> Option<usize> {
        debug_assert!(self.pagesize.is_power_of_two());
        ptr_utils::checked_align_up(size, self.pagesize - 1)
    }

    fn note_high_water(&mut self) {
        if self.sbrked_mem > self.max_sbrked_mem {
            self.max_sbrked_mem = self.sbrked_mem;
        }
        if self.mmapped_mem > self.max_mmapped_mem {
            self.max_mmapped_mem = self.mmapped_mem;
        }
        let total = self.sbrked_mem + self.mmapped_mem;
        if total > self.max_total_mem {
            self.max_total_mem = total;
        }
    }

    /// Establish the bin sentinel table. Runs once, on the first allocation.
    unsafe fn init_state(&mut self) -> Result<(), AllocError> {
        debug_assert!(self.bins.is_null());

        self.pagesize = self.system.page_size();
        debug_assert!(self.pagesize.is_power_of_two());

        let table_bytes = NBINS * core::mem::size_of::<LlistNode>() + MALLOC_ALIGN;
        let size = self.page_align(table_bytes).ok_or(AllocError)?;

        let base = match self.system.sbrk(size as isize) {
            Some(base) => base.as_ptr(),
            None => {
                self.contiguous = false;
                self.system.map(size).ok_or(AllocError)?.as_ptr()
            }
        };

        let bins = ptr_utils::align_up_by(base, ALIGN_MASK).cast::<LlistNode>();
        for b in 0..NBINS {
            LlistNode::init(bins.add(b));
        }
        self.bins = bins;

        Ok(())
    }

    /// Allocate `bytes` bytes of memory.
    ///
    /// A zero-byte request yields a valid pointer to a minimum-sized chunk;
    /// callers that want null-for-zero must check the size themselves.
    ///
    /// # Safety
    /// The returned memory must be released through this allocator.
    pub unsafe fn malloc(&mut self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        let nb = request_to_chunk_size(bytes).ok_or(AllocError)?;

        if self.bins.is_null() {
            self.init_state()?;
        }
        self.scan_for_errors();

        loop {
            if let Some(mem) = self.alloc_existing(nb) {
                return Ok(mem);
            }

            if self.have_fastchunks() {
                // Pending fast chunks may coalesce into a fit; collapse them
                // and retry before asking the system for more.
                self.consolidate();
                continue;
            }

            return self.sysmalloc(nb);
        }
    }

    /// One pass over everything already owned: fast bins, small bins, the
    /// unsorted queue, the large bins, the binmap, and finally top.
    unsafe fn alloc_existing(&mut self, nb: usize) -> Option<NonNull<u8>> {
        // Fast-bin hit: O(1) detach, no neighbor metadata touched.
        if nb <= self.get_max_fast() {
            let idx = fastbin_index(nb);
            let head = self.fastbins[idx];
            if !head.is_null() {
                let victim = Chunk(head);
                self.fastbins[idx] = victim.fast_next();
                return Some(NonNull::new_unchecked(victim.mem()));
            }
        }

        if !self.have_anychunks() {
            // No free chunk exists anywhere; skip straight to the frontier.
            return self.alloc_from_top(nb);
        }

        if in_smallbin_range(nb) {
            // Exact-fit small bin, taken from the tail for FIFO aging.
            let sentinel = self.bin_at(smallbin_index(nb));
            let node = LlistNode::tail(sentinel);
            if node != sentinel {
                let victim = Chunk::from_node(node);
                LlistNode::unlink(node);
                victim.next_by(nb).set_prev_in_use();
                return Some(NonNull::new_unchecked(victim.mem()));
            }
        } else if self.have_fastchunks() {
            // Big request: don't let fast-bin residue hide coalescable space.
            self.consolidate();
        }

        // Drain the unsorted queue from the tail. Each chunk gets one chance
        // to be taken before being routed to its definitive bin; this is the
        // only path that populates the normal bins.
        let unsorted = self.bin_at(UNSORTED_BIN);
        loop {
            let node = LlistNode::tail(unsorted);
            if node == unsorted {
                break;
            }
            let victim = Chunk::from_node(node);
            let size = victim.size();

            if in_smallbin_range(nb)
                && victim.base() == self.last_remainder
                && (*unsorted).bk == (*unsorted).fd
                && size >= nb + MIN_CHUNK_SIZE
            {
                // Reuse the most recent split remainder for consecutive small
                // requests; keeps them physically clustered.
                LlistNode::unlink(node);
                return Some(self.carve(victim, nb));
            }

            LlistNode::unlink(node);

            if size == nb {
                victim.next_by(size).set_prev_in_use();
                return Some(NonNull::new_unchecked(victim.mem()));
            }

            self.insert_into_bin(victim, size);
        }

        // Best fit from the request's own large bin: the tail-first walk
        // yields the smallest chunk that fits, oldest first among equals.
        if !in_smallbin_range(nb) {
            let idx = largebin_index(nb);
            if self.binmap.is_marked(idx) {
                let sentinel = self.bin_at(idx);
                let mut node = LlistNode::tail(sentinel);
                while node != sentinel {
                    let victim = Chunk::from_node(node);
                    if victim.size() >= nb {
                        LlistNode::unlink(node);
                        return Some(self.carve(victim, nb));
                    }
                    node = (*node).bk;
                }
            }
        }

        // Scan upward through the binmap. Anything in a higher bin is big
        // enough by construction; stale bits are cleared as discovered.
        let mut from = bin_index(nb) + 1;
        while let Some(b) = self.binmap.next_marked(from) {
            let sentinel = self.bin_at(b);
            if LlistNode::is_empty(sentinel) {
                self.binmap.unmark(b);
                from = b + 1;
                continue;
            }
            let node = LlistNode::tail(sentinel);
            let victim = Chunk::from_node(node);
            debug_assert!(victim.size() >= nb);
            LlistNode::unlink(node);
            return Some(self.carve(victim, nb));
        }

        self.alloc_from_top(nb)
    }

    /// Hand out an already-unlinked free chunk, splitting off the tail when
    /// it is big enough to stand alone. The remainder parks in the unsorted
    /// queue and, for small requests, becomes the locality hint.
    unsafe fn carve(&mut self, victim: Chunk, nb: usize) -> NonNull<u8> {
        let size = victim.size();
        debug_assert!(size >= nb);
        let remainder = size - nb;

        if remainder >= MIN_CHUNK_SIZE {
            let rem = victim.next_by(nb);
            rem.set_head(remainder | PREV_IN_USE);
            rem.set_foot(remainder);
            LlistNode::insert_after(self.bin_at(UNSORTED_BIN), rem.node_ptr());
            if in_smallbin_range(nb) {
                self.last_remainder = rem.base();
            }
            victim.set_size(nb);
        } else {
            // Exhaust: too little left over to track.
            victim.next_by(size).set_prev_in_use();
        }

        NonNull::new_unchecked(victim.mem())
    }

    /// Route a drained chunk into its home bin. Small bins push at the head;
    /// large bins keep descending size order, ties going in front of their
    /// equals so the oldest pops first.
    unsafe fn insert_into_bin(&mut self, chunk: Chunk, size: usize) {
        let bin;
        if in_smallbin_range(size) {
            bin = smallbin_index(size);
            LlistNode::insert_after(self.bin_at(bin), chunk.node_ptr());
        } else {
            bin = largebin_index(size);
            let sentinel = self.bin_at(bin);
            let mut fwd = (*sentinel).fd;
            while fwd != sentinel && Chunk::from_node(fwd).size() > size {
                fwd = (*fwd).fd;
            }
            LlistNode::insert_before(fwd, chunk.node_ptr());
        }
        self.binmap.mark(bin);
    }

    /// Split `nb` off the wilderness chunk, if it can spare that much while
    /// remaining a legal chunk itself.
    unsafe fn alloc_from_top(&mut self, nb: usize) -> Option<NonNull<u8>> {
        let top = self.top_chunk()?;
        let size = top.size();

        // phrased subtractively so an enormous `nb` cannot wrap
        if size - MIN_CHUNK_SIZE >= nb {
            let rest = top.next_by(nb);
            rest.set_head((size - nb) | PREV_IN_USE);
            self.top = rest.base();
            top.set_head(nb | PREV_IN_USE);
            Some(NonNull::new_unchecked(top.mem()))
        } else {
            None
        }
    }

    /// Release an allocation.
    ///
    /// # Safety
    /// `ptr` must have come from this allocator and not have been freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        self.scan_for_errors();
        let p = Chunk::from_mem(ptr.as_ptr());

        if p.is_mmapped() {
            // The leading pad recorded in prev_size recovers the mapping base.
            let pad = p.prev_size();
            let total = p.size() + pad;
            let base = p.base().sub(pad);
            if self.system.unmap(NonNull::new_unchecked(base), total) {
                self.n_mmaps -= 1;
                self.mmapped_mem -= total;
            }
            return;
        }

        let size = p.size();
        if size <= self.get_max_fast() {
            // Fast path: the chunk stays "in use" to its neighbors, so no
            // coalescing work and no metadata writes beyond one link.
            let idx = fastbin_index(size);
            p.set_fast_next(self.fastbins[idx]);
            self.fastbins[idx] = p.base();
            self.max_fast |= FASTCHUNKS_BIT | ANYCHUNKS_BIT;
            return;
        }

        self.free_inner(p, true);
    }

    unsafe fn free_inner(&mut self, p: Chunk, allow_trim: bool) {
        self.max_fast |= ANYCHUNKS_BIT;

        let size = self.coalesce(p);

        if size >= FASTBIN_CONSOLIDATION_THRESHOLD {
            if self.have_fastchunks() {
                self.consolidate();
            }
            if allow_trim && self.top_size() >= self.trim_threshold {
                self.systrim(self.top_pad);
            }
        }
    }

    /// Merge `p` with whichever physical neighbors are free, then either park
    /// the result at the head of the unsorted queue or fold it into top.
    /// Returns the merged size.
    unsafe fn coalesce(&mut self, p: Chunk) -> usize {
        let mut p = p;
        let mut size = p.size();

        if !p.prev_in_use() {
            let prev_size = p.prev_size();
            p = Chunk(p.base().sub(prev_size));
            size += prev_size;
            LlistNode::unlink(p.node_ptr());
        }

        let next = p.next_by(size);
        if next.base() == self.top {
            size += next.size();
            p.set_head(size | PREV_IN_USE);
            self.top = p.base();
        } else {
            let next_size = next.size();
            // read the successor's status before we touch anything of `next`
            let next_in_use = next.next_by(next_size).prev_in_use();
            if !next_in_use {
                LlistNode::unlink(next.node_ptr());
                size += next_size;
            } else {
                next.clear_prev_in_use();
            }

            // make the chunk observable as free before linking it anywhere
            p.set_head(size | PREV_IN_USE);
            p.set_foot(size);
            LlistNode::insert_after(self.bin_at(UNSORTED_BIN), p.node_ptr());
        }

        size
    }

    /// Drain every fast bin, merging each chunk with its free neighbors and
    /// staging the results in the unsorted queue (or top).
    unsafe fn consolidate(&mut self) {
        debug_assert!(!self.bins.is_null());
        self.max_fast &= !FASTCHUNKS_BIT;

        for idx in 0..NFASTBINS {
            let mut cursor = self.fastbins[idx];
            self.fastbins[idx] = ptr::null_mut();

            while !cursor.is_null() {
                let p = Chunk(cursor);
                cursor = p.fast_next();
                self.coalesce(p);
            }
        }
    }

    /// Acquire system memory for a request nothing on hand can satisfy.
    unsafe fn sysmalloc(&mut self, nb: usize) -> Result<NonNull<u8>, AllocError> {
        // Big requests get their own anonymous mapping and bypass the heap.
        if nb >= self.mmap_threshold && self.n_mmaps < self.n_mmaps_max {
            if let Some(mem) = self.mmap_chunk(nb) {
                return Ok(mem);
            }
        }

        let old_top = self.top_chunk();
        let old_size = self.top_size();

        let mut want = nb
            .checked_add(self.top_pad)
            .and_then(|v| v.checked_add(MIN_CHUNK_SIZE))
            .ok_or(AllocError)?;
        if self.contiguous {
            debug_assert!(old_size < want);
            want -= old_size;
        }
        let size = self.page_align(want).ok_or(AllocError)?;

        match self.system.sbrk(size as isize) {
            Some(brk) => {
                let brk = brk.as_ptr();

                if let Some(top) = old_top {
                    if brk == top.base().add(old_size) {
                        // seamless growth of the existing frontier
                        top.set_head((old_size + size) | PREV_IN_USE);
                        self.sbrked_mem += size;
                        self.note_high_water();
                        return self.alloc_from_top(nb).ok_or(AllocError);
                    }
                    if self.contiguous && brk < top.base().add(old_size) {
                        // a foreign extension moved the break backwards
                        self.contiguous = false;
                    }
                }

                // Fresh or discontiguous region: pad the first chunk forward
                // to alignment, then try to stretch the tail to the next page
                // boundary (a foreign extension can leave it ragged). When the
                // contiguity assumption shortened the request, stretch far
                // enough to cover the full allocation too.
                let mut region_end = brk.add(size);
                let aligned_base = ptr_utils::align_up_by(brk, ALIGN_MASK);
                let front_pad = aligned_base as usize - brk as usize;
                let end_misalign = region_end as usize & (self.pagesize - 1);
                let end_pad = if end_misalign != 0 { self.pagesize - end_misalign } else { 0 };
                let avail = size - front_pad;
                let needed = nb.checked_add(MIN_CHUNK_SIZE).ok_or(AllocError)?;
                let shortfall = if avail < needed {
                    self.page_align(needed - avail).ok_or(AllocError)?
                } else {
                    0
                };
                let correction = front_pad + end_pad + shortfall;

                if correction != 0 {
                    match self.system.sbrk(correction as isize) {
                        Some(snd) if snd.as_ptr() == region_end => {
                            region_end = region_end.add(correction);
                        }
                        _ => {
                            // couldn't stretch; keep only what we know we got
                            self.contiguous = false;
                        }
                    }
                }

                self.install_region(aligned_base, region_end as usize - aligned_base as usize, old_top);
                self.alloc_from_top(nb).ok_or(AllocError)
            }
            None => {
                // The break is stuck: fall back to mapping a sizable region
                // and run the heap inside it, permanently non-contiguous.
                let unit = nb
                    .checked_add(MIN_CHUNK_SIZE + MALLOC_ALIGN)
                    .map(|min| if min < MMAP_AS_SBRK_UNIT { MMAP_AS_SBRK_UNIT } else { min })
                    .ok_or(AllocError)?;
                let size = self.page_align(unit).ok_or(AllocError)?;
                let base = self.system.map(size).ok_or(AllocError)?;

                self.contiguous = false;
                self.install_region(base.as_ptr(), size, old_top);
                self.alloc_from_top(nb).ok_or(AllocError)
            }
        }
    }

    /// Make `base..base+size` the new wilderness, retiring the old top behind
    /// fenceposts so later coalescing can never bridge the hole in between.
    unsafe fn install_region(&mut self, base: *mut u8, size: usize, old_top: Option<Chunk>) {
        debug_assert!(ptr_utils::is_aligned_to(base, MALLOC_ALIGN));
        debug_assert!(size >= MIN_CHUNK_SIZE);

        let top = Chunk(base);
        top.set_head((size & !ALIGN_MASK) | PREV_IN_USE);
        self.top = base;
        self.sbrked_mem += size & !ALIGN_MASK;
        self.note_high_water();

        if let Some(old) = old_top {
            self.fencepost_old_top(old);
        }
    }

    /// Cap a retiring top with two in-use fenceposts; whatever body remains
    /// in front of them is given back through the normal free path (with
    /// trimming suppressed, as top just moved).
    unsafe fn fencepost_old_top(&mut self, old_top: Chunk) {
        let old_size = old_top.size();
        debug_assert!(old_size >= 2 * FENCE_SIZE);

        let body = (old_size - 2 * FENCE_SIZE) & !ALIGN_MASK;

        let fence = old_top.next_by(body);
        fence.set_head(FENCE_SIZE | PREV_IN_USE);
        fence.next_by(FENCE_SIZE).set_head(FENCE_SIZE | PREV_IN_USE);

        if body >= MIN_CHUNK_SIZE {
            old_top.set_head(body | PREV_IN_USE);
            self.free_inner(old_top, false);
        } else if body != 0 {
            // a sliver below the fence; dead space, but keep its head sane
            old_top.set_head(body | PREV_IN_USE);
        }
    }

    /// Serve `nb` from a dedicated anonymous mapping. The leading alignment
    /// pad is recorded in `prev_size` so the mapping base can be recovered.
    unsafe fn mmap_chunk(&mut self, nb: usize) -> Option<NonNull<u8>> {
        let size = self.page_align(nb.checked_add(WORD_SIZE + ALIGN_MASK)?)?;
        let base = self.system.map(size)?.as_ptr();

        let front_misalign = Chunk(base).mem() as usize & ALIGN_MASK;
        let correction = if front_misalign != 0 { MALLOC_ALIGN - front_misalign } else { 0 };

        let p = Chunk(base.add(correction));
        p.set_prev_size(correction);
        p.set_head((size - correction) | MMAPPED);

        self.n_mmaps += 1;
        self.mmapped_mem += size;
        self.note_high_water();

        Some(NonNull::new_unchecked(p.mem()))
    }

    /// Give pages at the frontier back to the system, keeping `pad` bytes of
    /// top in hand. Returns whether anything was released.
    unsafe fn systrim(&mut self, pad: usize) -> bool {
        let top = match self.top_chunk() {
            Some(top) => top,
            None => return false,
        };
        let top_size = top.size();

        let spare = match top_size.checked_sub(pad).and_then(|v| v.checked_sub(MIN_CHUNK_SIZE)) {
            Some(spare) => spare,
            None => return false,
        };
        let spare_pages = spare / self.pagesize;
        if spare_pages < 2 {
            return false;
        }
        let extra = (spare_pages - 1) * self.pagesize;

        // only shrink when we still own the frontier
        let top_end = top.base().add(top_size);
        match self.system.sbrk(0) {
            Some(brk) if brk.as_ptr() == top_end => {}
            _ => return false,
        }

        if self.system.sbrk(-(extra as isize)).is_none() {
            return false;
        }

        // re-query; the shrink may have been partial
        let new_brk = match self.system.sbrk(0) {
            Some(brk) => brk.as_ptr(),
            None => return false,
        };
        if new_brk >= top_end {
            return false;
        }

        let released = top_end as usize - new_brk as usize;
        self.sbrked_mem -= released;
        top.set_head((top_size - released) | PREV_IN_USE);
        true
    }

    /// Consolidate, then release whatever the frontier can spare beyond
    /// `pad` bytes. Returns `true` iff memory went back to the system.
    pub fn trim(&mut self, pad: usize) -> bool {
        if self.bins.is_null() {
            return false;
        }
        unsafe {
            self.scan_for_errors();
            self.consolidate();
            self.systrim(pad)
        }
    }

    /// Resize an allocation, preserving its leading contents.
    ///
    /// On failure the old pointer remains valid. A zero `bytes` behaves as a
    /// minimum-size allocation.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator.
    pub unsafe fn realloc(
        &mut self,
        ptr: NonNull<u8>,
        bytes: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        self.scan_for_errors();

        let nb = request_to_chunk_size(bytes).ok_or(AllocError)?;
        let oldp = Chunk::from_mem(ptr.as_ptr());
        let old_size = oldp.size();

        if oldp.is_mmapped() {
            // keep the mapping while it still fits with a word of slack
            if old_size >= nb + WORD_SIZE {
                return Ok(ptr);
            }
            let new_mem = self.malloc(bytes)?;
            let copy = core::cmp::min(old_size - 2 * WORD_SIZE, bytes);
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_mem.as_ptr(), copy);
            self.free(ptr);
            return Ok(new_mem);
        }

        let newp = oldp;
        let mut new_size = old_size;

        if old_size < nb {
            let next = oldp.next_by(old_size);

            if next.base() == self.top && old_size + next.size() - MIN_CHUNK_SIZE >= nb {
                // grow straight into the wilderness
                let grown = old_size + next.size();
                let new_top = oldp.next_by(nb);
                new_top.set_head((grown - nb) | PREV_IN_USE);
                self.top = new_top.base();
                oldp.set_size(nb);
                return Ok(ptr);
            }

            if next.base() != self.top && !next.is_in_use() && old_size + next.size() >= nb {
                // absorb the free successor
                LlistNode::unlink(next.node_ptr());
                new_size = old_size + next.size();
            } else {
                let new_mem = self.malloc(bytes)?;
                let np = Chunk::from_mem(new_mem.as_ptr());

                if np.base() == oldp.next_by(old_size).base() {
                    // the new chunk landed right behind the old one: splice
                    // them together and skip the copy
                    new_size = old_size + np.size();
                } else {
                    let copy = core::cmp::min(old_size - WORD_SIZE, bytes);
                    ptr::copy_nonoverlapping(ptr.as_ptr(), new_mem.as_ptr(), copy);
                    self.free(ptr);
                    return Ok(new_mem);
                }
            }
        }

        // in place, possibly grown; give back any tail worth tracking
        debug_assert!(new_size >= nb);
        let remainder = new_size - nb;
        if remainder >= MIN_CHUNK_SIZE {
            newp.set_size(nb);
            let rem = newp.next_by(nb);
            rem.set_head(remainder | PREV_IN_USE);
            // mark it allocated so the free path treats it normally
            rem.next_by(remainder).set_prev_in_use();
            self.free(NonNull::new_unchecked(rem.mem()));
        } else {
            newp.set_size(new_size);
            newp.next_by(new_size).set_prev_in_use();
        }

        Ok(NonNull::new_unchecked(newp.mem()))
    }

    /// Allocate `bytes` bytes aligned to `align`, which is rounded up to a
    /// power of two if it isn't one. Alignments at or below
    /// [`MALLOC_ALIGN`](crate::MALLOC_ALIGN) degenerate to
    /// [`malloc`](Self::malloc).
    ///
    /// # Safety
    /// As for [`malloc`](Self::malloc).
    pub unsafe fn memalign(
        &mut self,
        align: usize,
        bytes: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if align <= MALLOC_ALIGN {
            return self.malloc(bytes);
        }
        let align = align.checked_next_power_of_two().ok_or(AllocError)?;

        let nb = request_to_chunk_size(bytes).ok_or(AllocError)?;
        let over = nb
            .checked_add(align)
            .and_then(|v| v.checked_add(MIN_CHUNK_SIZE))
            .ok_or(AllocError)?;

        // over-allocate so an aligned payload with a freeable lead is
        // guaranteed to exist inside
        let mem = self.malloc(over - WORD_SIZE)?;
        let mut p = Chunk::from_mem(mem.as_ptr());

        if mem.as_ptr() as usize & (align - 1) != 0 {
            let aligned = ptr_utils::align_up_by(mem.as_ptr(), align - 1);
            let mut newp = Chunk::from_mem(aligned);
            if newp.base() as usize - (p.base() as usize) < MIN_CHUNK_SIZE {
                // lead too small to free; the next aligned spot always fits
                newp = Chunk::from_mem(aligned.add(align));
            }
            let lead = newp.base() as usize - p.base() as usize;
            let new_size = p.size() - lead;

            if p.is_mmapped() {
                // shift the mapping bookkeeping instead of freeing the lead
                newp.set_prev_size(p.prev_size() + lead);
                newp.set_head(new_size | MMAPPED);
                return Ok(NonNull::new_unchecked(newp.mem()));
            }

            newp.set_head(new_size | PREV_IN_USE);
            newp.next_by(new_size).set_prev_in_use();
            p.set_size(lead);
            self.free(NonNull::new_unchecked(p.mem()));
            p = newp;
        }

        if !p.is_mmapped() {
            let size = p.size();
            let remainder = size - nb;
            if remainder >= MIN_CHUNK_SIZE {
                p.set_size(nb);
                let rem = p.next_by(nb);
                rem.set_head(remainder | PREV_IN_USE);
                rem.next_by(remainder).set_prev_in_use();
                self.free(NonNull::new_unchecked(rem.mem()));
            }
        }

        Ok(NonNull::new_unchecked(p.mem()))
    }

    /// Allocate zeroed memory for `count` elements of `elem_size` bytes.
    /// Overflow of the product is an error.
    ///
    /// # Safety
    /// As for [`malloc`](Self::malloc).
    pub unsafe fn calloc(
        &mut self,
        count: usize,
        elem_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let total = count.checked_mul(elem_size).ok_or(AllocError)?;
        let mem = self.malloc(total)?;

        let p = Chunk::from_mem(mem.as_ptr());
        if !(p.is_mmapped() && self.system.maps_zeroed()) {
            ptr::write_bytes(mem.as_ptr(), 0, total);
        }

        Ok(mem)
    }

    /// Allocate `out.len()` independent zeroed chunks of `elem_size` bytes
    /// each, all carved from one host chunk.
    ///
    /// Each resulting pointer is freed individually; the host space is only
    /// reclaimed once all of them are.
    ///
    /// # Safety
    /// As for [`malloc`](Self::malloc).
    pub unsafe fn independent_calloc(
        &mut self,
        elem_size: usize,
        out: &mut [*mut u8],
    ) -> Result<(), AllocError> {
        let chunk_size = request_to_chunk_size(elem_size).ok_or(AllocError)?;
        self.ialloc(out, |_| chunk_size, true)
    }

    /// Allocate `sizes.len()` independent chunks of the given byte sizes,
    /// all carved from one host chunk. `out` must be the same length.
    ///
    /// # Safety
    /// As for [`malloc`](Self::malloc).
    pub unsafe fn independent_comalloc(
        &mut self,
        sizes: &[usize],
        out: &mut [*mut u8],
    ) -> Result<(), AllocError> {
        if sizes.len() != out.len() {
            return Err(AllocError);
        }
        for &bytes in sizes {
            request_to_chunk_size(bytes).ok_or(AllocError)?;
        }
        self.ialloc(out, |i| request_to_chunk_size(sizes[i]).unwrap_or(0), false)
    }

    unsafe fn ialloc(
        &mut self,
        out: &mut [*mut u8],
        chunk_size_of: impl Fn(usize) -> usize,
        zero: bool,
    ) -> Result<(), AllocError> {
        let count = out.len();
        if count == 0 {
            return Ok(());
        }

        let mut total = 0usize;
        for i in 0..count {
            total = total.checked_add(chunk_size_of(i)).ok_or(AllocError)?;
        }

        // the aggregate must live on the heap so its pieces free like any
        // other chunk; suspend direct mapping for the one allocation
        let saved_threshold = self.mmap_threshold;
        let saved_mmap_max = self.n_mmaps_max;
        self.mmap_threshold = usize::MAX;
        self.n_mmaps_max = 0;
        let result = self.malloc(total - WORD_SIZE);
        self.mmap_threshold = saved_threshold;
        self.n_mmaps_max = saved_mmap_max;
        let mem = result?;

        let mut p = Chunk::from_mem(mem.as_ptr());
        debug_assert!(!p.is_mmapped());
        let mut remaining = p.size();

        if zero {
            ptr::write_bytes(mem.as_ptr(), 0, remaining - WORD_SIZE);
        }

        for (i, slot) in out.iter_mut().enumerate() {
            if i == count - 1 {
                // the final piece absorbs any overallocation slack
                p.set_head(remaining | PREV_IN_USE);
                *slot = p.mem();
            } else {
                let piece = chunk_size_of(i);
                p.set_head(piece | PREV_IN_USE);
                *slot = p.mem();
                p = p.next_by(piece);
                remaining -= piece;
            }
        }

        Ok(())
    }

    /// The number of bytes actually usable behind `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let p = Chunk::from_mem(ptr.as_ptr());
        if p.is_mmapped() {
            p.size() - 2 * WORD_SIZE
        } else {
            p.size() - WORD_SIZE
        }
    }

    /// Adjust a [`Tunable`]. Returns whether the value was accepted.
    pub fn tune(&mut self, param: Tunable, value: usize) -> bool {
        match param {
            Tunable::MaxFast => {
                // drain the fast bins first; a lowered bound must not strand
                // residents above it
                if !self.bins.is_null() {
                    unsafe { self.consolidate() };
                }
                if value == 0 {
                    self.max_fast &= MAX_FAST_FLAGS;
                    return true;
                }
                match request_to_chunk_size(value) {
                    Some(bound) if bound <= MAX_FAST_CEILING => {
                        self.max_fast = bound | (self.max_fast & MAX_FAST_FLAGS);
                        true
                    }
                    _ => false,
                }
            }
            Tunable::TrimThreshold => {
                self.trim_threshold = value;
                true
            }
            Tunable::TopPad => {
                self.top_pad = value;
                true
            }
            Tunable::MmapThreshold => {
                self.mmap_threshold = value;
                true
            }
            Tunable::MmapMax => {
                self.n_mmaps_max = value;
                true
            }
        }
    }

    #[cfg(not(any(test, feature = "fuzzing")))]
    #[inline]
    pub(crate) fn scan_for_errors(&self) {}

    /// Debugging function checking the structural invariants: alignment,
    /// boundary-tag agreement, coalescing, binmap consistency, disjointness.
    #[cfg(any(test, feature = "fuzzing"))]
    pub(crate) fn scan_for_errors(&self) {
        if self.bins.is_null() {
            return;
        }

        let mut spans: std::vec::Vec<(usize, usize)> = std::vec::Vec::new();
        let mut note_span = |base: usize, size: usize| {
            for &(other_base, other_size) in &spans {
                let overlaps = !(base + size <= other_base || other_base + other_size <= base);
                assert!(!overlaps, "{:#x}+{:#x} intersects {:#x}+{:#x}", base, size, other_base, other_size);
            }
            spans.push((base, size));
        };

        unsafe {
            for b in UNSORTED_BIN..NBINS {
                for node in LlistNode::iter(self.bin_at(b)) {
                    let chunk = Chunk::from_node(node);
                    let size = chunk.size();

                    assert!(size >= MIN_CHUNK_SIZE);
                    assert_eq!(size & ALIGN_MASK, 0);
                    assert!(ptr_utils::is_aligned_to(chunk.mem(), MALLOC_ALIGN));
                    assert!(!chunk.is_mmapped());
                    // no two free chunks may touch
                    assert!(chunk.prev_in_use());

                    let next = chunk.next_by(size);
                    assert_eq!(next.prev_size(), size, "foot disagrees with head");
                    assert!(!next.prev_in_use(), "successor thinks this chunk is in use");
                    assert_ne!(next.base(), self.top, "free chunk adjacent to top escaped merging");

                    if b != UNSORTED_BIN {
                        assert_eq!(bin_index(size), b);
                        assert!(self.binmap.is_marked(b));
                    }

                    note_span(chunk.base() as usize, size);
                }
            }

            for (idx, &head) in self.fastbins.iter().enumerate() {
                let mut cursor = head;
                while !cursor.is_null() {
                    let chunk = Chunk(cursor);
                    let size = chunk.size();

                    assert_eq!(fastbin_index(size), idx);
                    assert!(size <= self.get_max_fast());
                    assert!(ptr_utils::is_aligned_to(chunk.mem(), MALLOC_ALIGN));
                    // fast chunks stay "in use" to the outside world
                    assert!(chunk.next_by(size).prev_in_use());
                    assert!(self.have_fastchunks());

                    note_span(chunk.base() as usize, size);
                    cursor = chunk.fast_next();
                }
            }

            if let Some(top) = self.top_chunk() {
                assert!(top.prev_in_use());
                assert!(ptr_utils::is_aligned_to(top.base(), MALLOC_ALIGN));
                assert!(top.size() >= MIN_CHUNK_SIZE);
                note_span(top.base() as usize, top.size());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{ArenaSource, ARENA_PAGE_SIZE};

    fn new_heap(pages: usize) -> Marl<ArenaSource> {
        let size = (pages + 2) * ARENA_PAGE_SIZE;
        let region: *mut u8 = Box::into_raw(vec![0u8; size].into_boxed_slice()).cast();
        Marl::new(unsafe { ArenaSource::new(region, size) })
    }

    #[test]
    fn zero_byte_allocation_is_valid() {
        let mut heap = new_heap(16);

        unsafe {
            let a = heap.malloc(0).unwrap();
            assert_eq!(a.as_ptr() as usize % MALLOC_ALIGN, 0);
            assert!(heap.usable_size(a) >= MIN_CHUNK_SIZE - 2 * WORD_SIZE);
            assert!(heap.stats().in_use_bytes > 0);

            heap.free(a);
            assert_eq!(heap.stats().in_use_bytes, 0);
        }
    }

    #[test]
    fn fastbin_reuse_is_lifo() {
        let mut heap = new_heap(16);

        unsafe {
            let a = heap.malloc(24).unwrap();
            let b = heap.malloc(24).unwrap();

            heap.free(a);
            let c = heap.malloc(24).unwrap();
            assert_eq!(c, a);

            heap.free(b);
            heap.free(c);
            let d = heap.malloc(24).unwrap();
            assert_eq!(d, c, "most recently freed chunk must be reused first");
        }
    }

    #[test]
    fn consolidation_merges_neighbors_without_system_call() {
        let mut heap = new_heap(32);

        unsafe {
            let slots: Vec<_> = (0..10).map(|_| heap.malloc(24).unwrap()).collect();

            // pin the frontier down to its minimum so nothing can come from top
            let keepcost = heap.stats().keepcost;
            let filler = heap.malloc(keepcost - MIN_CHUNK_SIZE - WORD_SIZE).unwrap();
            assert_eq!(heap.stats().keepcost, MIN_CHUNK_SIZE);

            for &slot in &slots {
                heap.free(slot);
            }
            assert_eq!(heap.stats().fastbin_count, 10);

            let sbrked_before = heap.stats().sbrked_bytes;
            let c = heap.malloc(40).unwrap();

            // the ten 32-byte neighbors merged into one block that now serves
            // the request, with no new system memory
            assert_eq!(c, slots[0]);
            assert_eq!(heap.stats().sbrked_bytes, sbrked_before);
            assert_eq!(heap.stats().fastbin_count, 0);

            heap.free(c);
            heap.free(filler);
        }
    }

    #[test]
    fn heap_allocation_returns_to_system_on_trim() {
        let mut heap = new_heap(64);

        unsafe {
            let a = heap.malloc(100_000).unwrap();
            assert_eq!(heap.stats().mmap_count, 0, "below the mapping threshold");
            heap.free(a);
        }

        let before = heap.stats();
        assert!(heap.trim(0));
        let after = heap.stats();

        let released = before.sbrked_bytes - after.sbrked_bytes;
        assert!(released > 0);
        assert_eq!(released % ARENA_PAGE_SIZE, 0);
        assert_eq!(after.in_use_bytes, 0);

        // nothing left to give back
        assert!(!heap.trim(0));
    }

    #[test]
    fn large_request_uses_direct_mapping() {
        let mut heap = new_heap(256);

        unsafe {
            let a = heap.malloc(400_000).unwrap();

            let stats = heap.stats();
            assert_eq!(stats.mmap_count, 1);
            assert!(stats.mmapped_bytes >= 400_000);
            assert!(heap.usable_size(a) >= 400_000);

            // the mapping is fully writable
            a.as_ptr().write_bytes(0xa5, heap.usable_size(a));

            heap.free(a);
            let stats = heap.stats();
            assert_eq!(stats.mmap_count, 0);
            assert_eq!(stats.mmapped_bytes, 0);
            assert!(stats.max_total_bytes >= 400_000);
        }
    }

    #[test]
    fn realloc_shrink_feeds_tail_forward() {
        let mut heap = new_heap(16);

        unsafe {
            let p = heap.malloc(64).unwrap();
            for offset in 0..32 {
                p.as_ptr().add(offset).write(offset as u8);
            }

            let q = heap.realloc(p, 32).unwrap();
            assert_eq!(q, p, "shrinking must not move the chunk");
            for offset in 0..32 {
                assert_eq!(q.as_ptr().add(offset).read(), offset as u8);
            }

            // the split-off tail serves the next small request
            let r = heap.malloc(16).unwrap();
            assert_eq!(r.as_ptr(), q.as_ptr().add(48));

            heap.free(r);
            heap.free(q);
        }
    }

    #[test]
    fn usable_size_covers_request() {
        let mut heap = new_heap(64);

        unsafe {
            for request in [0, 1, 8, 24, 100, 500, 4000, 60_000] {
                let p = heap.malloc(request).unwrap();
                let usable = heap.usable_size(p);
                assert!(usable >= request, "usable {} < requested {}", usable, request);
                p.as_ptr().write_bytes(0xee, usable);
                heap.free(p);
            }
        }
    }

    #[test]
    fn realloc_preserves_contents_on_move() {
        let mut heap = new_heap(64);

        unsafe {
            let a = heap.malloc(100).unwrap();
            a.as_ptr().write_bytes(0xab, 100);
            // an allocated successor rules out in-place growth
            let blocker = heap.malloc(100).unwrap();

            let q = heap.realloc(a, 5000).unwrap();
            assert_ne!(q, a);
            for offset in 0..100 {
                assert_eq!(q.as_ptr().add(offset).read(), 0xab);
            }

            heap.free(q);
            heap.free(blocker);
        }
    }

    #[test]
    fn exact_fit_comes_from_unsorted_queue() {
        let mut heap = new_heap(16);

        unsafe {
            let a = heap.malloc(100).unwrap();
            let blocker = heap.malloc(100).unwrap();

            heap.free(a);
            let stats = heap.stats();
            assert_eq!(stats.fastbin_count, 0, "beyond the fast-bin bound");
            assert!(stats.free_count >= 2);

            let b = heap.malloc(100).unwrap();
            assert_eq!(b, a, "exact fit must reuse the freed chunk");

            heap.free(b);
            heap.free(blocker);
        }
    }

    #[test]
    fn calloc_zeroes_reused_memory() {
        let mut heap = new_heap(16);

        unsafe {
            let dirty = heap.malloc(300).unwrap();
            dirty.as_ptr().write_bytes(0xff, 300);
            let blocker = heap.malloc(24).unwrap();
            heap.free(dirty);

            let zeroed = heap.calloc(10, 30).unwrap();
            for offset in 0..300 {
                assert_eq!(zeroed.as_ptr().add(offset).read(), 0, "byte {}", offset);
            }

            assert!(heap.calloc(usize::MAX, 2).is_err());
            assert!(heap.calloc(2, usize::MAX).is_err());

            heap.free(zeroed);
            heap.free(blocker);
        }
    }

    #[test]
    fn independent_calloc_carves_one_host() {
        let mut heap = new_heap(16);

        unsafe {
            let mut out = [ptr::null_mut::<u8>(); 8];
            heap.independent_calloc(24, &mut out).unwrap();

            for pair in out.windows(2) {
                // consecutive pieces of a single host chunk
                assert_eq!(pair[1], pair[0].add(32));
            }
            for &p in &out {
                assert_eq!(p as usize % MALLOC_ALIGN, 0);
                for offset in 0..24 {
                    assert_eq!(p.add(offset).read(), 0);
                }
                p.write_bytes(0xd1, 24);
            }

            // freeing out of order must leave the others intact
            for &p in out.iter().step_by(2) {
                heap.free(NonNull::new_unchecked(p));
            }
            for &p in out.iter().skip(1).step_by(2) {
                for offset in 0..24 {
                    assert_eq!(p.add(offset).read(), 0xd1);
                }
                heap.free(NonNull::new_unchecked(p));
            }
        }
    }

    #[test]
    fn independent_comalloc_varied_sizes() {
        let mut heap = new_heap(16);

        unsafe {
            let sizes = [10usize, 200, 50];
            let mut out = [ptr::null_mut::<u8>(); 3];
            heap.independent_comalloc(&sizes, &mut out).unwrap();

            for (i, (&p, &bytes)) in out.iter().zip(&sizes).enumerate() {
                assert!(!p.is_null());
                assert!(heap.usable_size(NonNull::new_unchecked(p)) >= bytes);
                p.write_bytes(i as u8 + 1, bytes);
            }
            for (i, (&p, &bytes)) in out.iter().zip(&sizes).enumerate() {
                for offset in 0..bytes {
                    assert_eq!(p.add(offset).read(), i as u8 + 1);
                }
                heap.free(NonNull::new_unchecked(p));
            }

            let mut short = [ptr::null_mut::<u8>(); 2];
            assert!(heap.independent_comalloc(&sizes, &mut short).is_err());
        }
    }

    #[test]
    fn tunable_bounds_and_effects() {
        let mut heap = new_heap(64);

        // the fast-bin bound refuses values past its ceiling
        assert!(!heap.tune(Tunable::MaxFast, 200_000));
        assert!(heap.tune(Tunable::MaxFast, 64));

        unsafe {
            // disabling fast bins sends small frees through coalescing
            assert!(heap.tune(Tunable::MaxFast, 0));
            let a = heap.malloc(24).unwrap();
            let blocker = heap.malloc(24).unwrap();
            heap.free(a);
            assert_eq!(heap.stats().fastbin_count, 0);
            let b = heap.malloc(24).unwrap();
            assert_eq!(b, a);
            heap.free(b);
            heap.free(blocker);

            // a lowered mapping threshold diverts modest requests to mappings
            assert!(heap.tune(Tunable::MmapThreshold, 4096));
            let m = heap.malloc(8000).unwrap();
            assert_eq!(heap.stats().mmap_count, 1);
            heap.free(m);
            assert_eq!(heap.stats().mmap_count, 0);
        }
    }

    #[test]
    fn memalign_alignment_and_rounding() {
        let mut heap = new_heap(64);

        unsafe {
            for align in [32usize, 64, 256, 1024, 4096] {
                let p = heap.memalign(align, 100).unwrap();
                assert_eq!(p.as_ptr() as usize % align, 0, "align {}", align);
                p.as_ptr().write_bytes(0xcc, 100);
                heap.free(p);
            }

            // non-power-of-two alignments round up
            let p = heap.memalign(48, 100).unwrap();
            assert_eq!(p.as_ptr() as usize % 64, 0);
            heap.free(p);

            // small alignments degenerate to plain allocation
            let p = heap.memalign(8, 100).unwrap();
            assert_eq!(p.as_ptr() as usize % MALLOC_ALIGN, 0);
            heap.free(p);
        }
    }

    #[test]
    fn trim_on_untouched_heap_is_noop() {
        let mut heap = new_heap(16);
        assert!(!heap.trim(0));
    }

    #[test]
    fn exhausted_arena_reports_out_of_memory() {
        let mut heap = new_heap(2);

        unsafe {
            assert!(heap.malloc(100_000).is_err());
            // small allocations still work afterwards
            let a = heap.malloc(24).unwrap();
            heap.free(a);
        }
    }

    #[test]
    fn random_actions_stress() {
        fastrand::seed(0x6d61726c);

        let mut heap = new_heap(512);
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
        let mut tag: u8 = 0;

        unsafe {
            for step in 0..2000 {
                match fastrand::usize(0..10) {
                    0..=3 => {
                        if live.len() >= 120 {
                            continue;
                        }
                        tag = tag.wrapping_add(1).max(1);
                        let request = fastrand::usize(1..4000);
                        if let Ok(p) = heap.malloc(request) {
                            assert_eq!(p.as_ptr() as usize % MALLOC_ALIGN, 0);
                            assert!(heap.usable_size(p) >= request);
                            p.as_ptr().write_bytes(tag, request);
                            live.push((p, request, tag));
                        }
                    }
                    4 => {
                        if live.len() >= 120 {
                            continue;
                        }
                        tag = tag.wrapping_add(1).max(1);
                        let request = fastrand::usize(1..2000);
                        let align = MALLOC_ALIGN << fastrand::usize(1..7);
                        if let Ok(p) = heap.memalign(align, request) {
                            assert_eq!(p.as_ptr() as usize % align, 0);
                            p.as_ptr().write_bytes(tag, request);
                            live.push((p, request, tag));
                        }
                    }
                    5..=6 => {
                        if live.is_empty() {
                            continue;
                        }
                        let (p, request, tag) = live.swap_remove(fastrand::usize(0..live.len()));
                        for offset in 0..request {
                            assert_eq!(
                                p.as_ptr().add(offset).read(),
                                tag,
                                "step {}: byte {} of a {}-byte block was clobbered",
                                step,
                                offset,
                                request
                            );
                        }
                        heap.free(p);
                    }
                    7..=8 => {
                        if live.is_empty() {
                            continue;
                        }
                        let index = fastrand::usize(0..live.len());
                        let (p, request, tag) = live[index];
                        let new_request = fastrand::usize(1..8000);
                        if let Ok(q) = heap.realloc(p, new_request) {
                            let preserved = core::cmp::min(request, new_request);
                            for offset in 0..preserved {
                                assert_eq!(q.as_ptr().add(offset).read(), tag);
                            }
                            q.as_ptr().write_bytes(tag, new_request);
                            live[index] = (q, new_request, tag);
                        }
                    }
                    _ => {
                        heap.trim(fastrand::usize(0..16384));
                    }
                }
            }

            for (p, request, tag) in live.drain(..) {
                for offset in 0..request {
                    assert_eq!(p.as_ptr().add(offset).read(), tag);
                }
                heap.free(p);
            }
        }

        heap.trim(0);
        let stats = heap.stats();
        assert_eq!(stats.in_use_bytes, 0);
        assert_eq!(stats.fastbin_count, 0);
        assert_eq!(stats.free_count, 1, "everything must coalesce back into top");
        assert_eq!(stats.mmap_count, 0);
    }
}
