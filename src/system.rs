//! The system memory interface: where the heap gets its pages.
//!
//! The allocator core is generic over a [`SystemSource`], which models the two
//! ways it acquires memory: a contiguous break that can be pushed up and
//! pulled back (`sbrk`), and independent anonymous mappings for requests big
//! enough to bypass the heap (`map`/`unmap`).
//!
//! [`Os`] backs these with the real process break and `mmap` on unix.
//! [`ArenaSource`] serves both out of a caller-supplied region, which is what
//! the test suite runs on: every test gets a fresh, deterministic "operating
//! system" of its own.

use core::ptr::NonNull;

use crate::ptr_utils;

/// A provider of system memory for the allocator.
///
/// # Safety
/// Implementors must hand out memory that is valid for reads and writes,
/// exclusively owned by the caller until returned, and must not recurse into
/// the allocator they are backing.
pub unsafe trait SystemSource {
    /// Adjust the contiguous break by `delta` bytes, returning the *previous*
    /// break on success. `sbrk(0)` queries the current break.
    fn sbrk(&mut self, delta: isize) -> Option<NonNull<u8>>;

    /// Map a fresh anonymous region of at least `size` bytes, page-aligned.
    fn map(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Release a region previously returned by [`map`](Self::map).
    ///
    /// # Safety
    /// `base` and `size` must describe exactly one prior mapping.
    unsafe fn unmap(&mut self, base: NonNull<u8>, size: usize) -> bool;

    /// The allocation granularity of this source. Must be a power of two.
    fn page_size(&self) -> usize;

    /// Whether memory returned by [`map`](Self::map) is zero-filled.
    fn maps_zeroed(&self) -> bool {
        false
    }
}

/// The real thing: the process break and anonymous mappings.
///
/// Note that the process break is shared per-process state; mixing this with
/// another break-moving allocator in the same process degrades the heap to
/// non-contiguous operation but stays correct.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Os;

#[cfg(unix)]
unsafe impl SystemSource for Os {
    fn sbrk(&mut self, delta: isize) -> Option<NonNull<u8>> {
        let prev = unsafe { libc::sbrk(delta as libc::intptr_t) };
        if prev as isize == -1 {
            return None;
        }
        NonNull::new(prev.cast())
    }

    fn map(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            log::debug!("anonymous mapping of {} bytes failed: {}", size, errno::errno());
            return None;
        }

        NonNull::new(ptr.cast())
    }

    unsafe fn unmap(&mut self, base: NonNull<u8>, size: usize) -> bool {
        if libc::munmap(base.as_ptr().cast(), size) != 0 {
            log::warn!(
                "munmap failed: {}, base {:p}, size {}",
                errno::errno(),
                base.as_ptr(),
                size
            );
            return false;
        }
        true
    }

    fn page_size(&self) -> usize {
        let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if result > 0 { result as usize } else { 4096 }
    }

    fn maps_zeroed(&self) -> bool {
        true
    }
}

/// The page granularity [`ArenaSource`] reports.
pub const ARENA_PAGE_SIZE: usize = 4096;

/// A [`SystemSource`] serving a caller-supplied region of memory.
///
/// The break grows from the bottom of the region; mappings are carved from
/// the top, growing downward. The two fail cleanly when they would meet.
/// Unmapping anything but the lowest live mapping abandons that space, which
/// is an acceptable loss for the deterministic heaps this type exists for.
#[derive(Debug)]
pub struct ArenaSource {
    brk_floor: *mut u8,
    brk: *mut u8,
    map_brk: *mut u8,
    map_ceiling: *mut u8,
}

unsafe impl Send for ArenaSource {}

impl ArenaSource {
    /// Serve memory out of `size` bytes at `base`.
    ///
    /// Both edges are aligned inward to [`ARENA_PAGE_SIZE`], so up to two
    /// pages of slack may go unused.
    ///
    /// # Safety
    /// The region must be valid for reads and writes and must not be touched
    /// by anything else for the lifetime of the source.
    pub unsafe fn new(base: *mut u8, size: usize) -> Self {
        let floor = ptr_utils::align_up_by(base, ARENA_PAGE_SIZE - 1);
        let mut ceiling = ptr_utils::align_down_by(base.wrapping_add(size), ARENA_PAGE_SIZE - 1);
        if ceiling < floor {
            ceiling = floor;
        }

        Self { brk_floor: floor, brk: floor, map_brk: ceiling, map_ceiling: ceiling }
    }

    fn sbrk_room(&self) -> usize {
        self.map_brk as usize - self.brk as usize
    }
}

unsafe impl SystemSource for ArenaSource {
    fn sbrk(&mut self, delta: isize) -> Option<NonNull<u8>> {
        let old = self.brk;

        if delta >= 0 {
            if delta as usize > self.sbrk_room() {
                return None;
            }
            self.brk = self.brk.wrapping_add(delta as usize);
        } else {
            let decrement = delta.unsigned_abs();
            if decrement > self.brk as usize - self.brk_floor as usize {
                return None;
            }
            self.brk = self.brk.wrapping_sub(decrement);
        }

        NonNull::new(old)
    }

    fn map(&mut self, size: usize) -> Option<NonNull<u8>> {
        let size = ptr_utils::checked_align_up(size, ARENA_PAGE_SIZE - 1)?;
        if size > self.sbrk_room() {
            return None;
        }

        self.map_brk = self.map_brk.wrapping_sub(size);
        NonNull::new(self.map_brk)
    }

    unsafe fn unmap(&mut self, base: NonNull<u8>, size: usize) -> bool {
        if base.as_ptr() == self.map_brk {
            let size = match ptr_utils::checked_align_up(size, ARENA_PAGE_SIZE - 1) {
                Some(size) => size,
                None => return false,
            };
            let reclaimed = self.map_brk.wrapping_add(size);
            self.map_brk = if reclaimed > self.map_ceiling { self.map_ceiling } else { reclaimed };
        }
        // interior mappings are abandoned rather than tracked
        true
    }

    fn page_size(&self) -> usize {
        ARENA_PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_region(size: usize) -> *mut u8 {
        Box::into_raw(vec![0u8; size].into_boxed_slice()).cast()
    }

    #[test]
    fn break_grows_and_shrinks() {
        let region = leaked_region(8 * ARENA_PAGE_SIZE);
        let mut source = unsafe { ArenaSource::new(region, 8 * ARENA_PAGE_SIZE) };

        let start = source.sbrk(0).unwrap();
        let prev = source.sbrk(ARENA_PAGE_SIZE as isize).unwrap();
        assert_eq!(prev, start);
        assert_eq!(
            source.sbrk(0).unwrap().as_ptr(),
            start.as_ptr().wrapping_add(ARENA_PAGE_SIZE)
        );

        // shrink back down, but never below the original floor
        source.sbrk(-(ARENA_PAGE_SIZE as isize)).unwrap();
        assert_eq!(source.sbrk(0).unwrap(), start);
        assert!(source.sbrk(-(ARENA_PAGE_SIZE as isize)).is_none());
    }

    #[test]
    fn mappings_carve_from_the_top() {
        let region = leaked_region(8 * ARENA_PAGE_SIZE);
        let mut source = unsafe { ArenaSource::new(region, 8 * ARENA_PAGE_SIZE) };

        let a = source.map(ARENA_PAGE_SIZE).unwrap();
        let b = source.map(ARENA_PAGE_SIZE + 1).unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr().wrapping_add(2 * ARENA_PAGE_SIZE));

        // the lowest mapping is reclaimed, the next map reuses its space
        unsafe { assert!(source.unmap(b, ARENA_PAGE_SIZE + 1)) };
        let c = source.map(ARENA_PAGE_SIZE).unwrap();
        assert_eq!(c.as_ptr(), a.as_ptr().wrapping_sub(ARENA_PAGE_SIZE));
    }

    #[test]
    fn break_and_mappings_collide_cleanly() {
        // the region loses up to two pages to inward alignment
        let region = leaked_region(6 * ARENA_PAGE_SIZE);
        let mut source = unsafe { ArenaSource::new(region, 6 * ARENA_PAGE_SIZE) };

        source.sbrk(ARENA_PAGE_SIZE as isize).unwrap();
        source.map(ARENA_PAGE_SIZE).unwrap();

        assert!(source.sbrk((6 * ARENA_PAGE_SIZE) as isize).is_none());
        assert!(source.map(6 * ARENA_PAGE_SIZE).is_none());

        // what remains is still usable from either end
        assert!(source.map(ARENA_PAGE_SIZE).is_some());
        assert!(source.sbrk(ARENA_PAGE_SIZE as isize).is_some());
    }
}
