#![no_main]

use std::ptr::NonNull;

use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use marl::{ArenaSource, Marl, Tunable};

#[derive(Arbitrary, Debug)]
enum Action {
    /// Allocate `size % 0x2000` bytes.
    Alloc { size: u16 },
    /// Allocate with an alignment of `MALLOC_ALIGN << (align_shift % 8)`.
    Memalign { size: u16, align_shift: u8 },
    /// Allocate zeroed memory for `count % 64` elements of `size % 256` bytes.
    Calloc { count: u8, size: u8 },
    /// Free the ith live allocation.
    Free { index: u8 },
    /// Reallocate the ith live allocation.
    Realloc { index: u8, new_size: u16 },
    /// Release spare frontier pages.
    Trim { pad: u16 },
    /// Adjust the fast-bin bound.
    TuneMaxFast { request: u8 },
    /// Adjust the mapping threshold.
    TuneMmapThreshold { kib: u8 },
}
use Action::*;

const HEAP_SIZE: usize = 4 << 20;

fuzz_target!(|actions: Vec<Action>| {
    let region: *mut u8 = Box::into_raw(vec![0u8; HEAP_SIZE].into_boxed_slice()).cast();
    let mut heap = Marl::new(unsafe { ArenaSource::new(region, HEAP_SIZE) });

    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
    let mut tag: u8 = 0;

    for action in actions {
        tag = tag.wrapping_add(1).max(1);
        match action {
            Alloc { size } => unsafe {
                let request = size as usize % 0x2000;
                if let Ok(p) = heap.malloc(request) {
                    assert!(heap.usable_size(p) >= request);
                    p.as_ptr().write_bytes(tag, request);
                    live.push((p, request, tag));
                }
            },
            Memalign { size, align_shift } => unsafe {
                let request = size as usize % 0x2000;
                let align = marl::MALLOC_ALIGN << (align_shift % 8);
                if let Ok(p) = heap.memalign(align, request) {
                    assert_eq!(p.as_ptr() as usize % align, 0);
                    p.as_ptr().write_bytes(tag, request);
                    live.push((p, request, tag));
                }
            },
            Calloc { count, size } => unsafe {
                let count = count as usize % 64;
                let size = size as usize % 256;
                if let Ok(p) = heap.calloc(count, size) {
                    for offset in 0..count * size {
                        assert_eq!(p.as_ptr().add(offset).read(), 0);
                    }
                    p.as_ptr().write_bytes(tag, count * size);
                    live.push((p, count * size, tag));
                }
            },
            Free { index } => unsafe {
                if (index as usize) < live.len() {
                    let (p, request, tag) = live.swap_remove(index as usize);
                    for offset in 0..request {
                        assert_eq!(p.as_ptr().add(offset).read(), tag);
                    }
                    heap.free(p);
                }
            },
            Realloc { index, new_size } => unsafe {
                if (index as usize) < live.len() {
                    let (p, request, tag) = live[index as usize];
                    let new_request = new_size as usize % 0x4000;
                    if let Ok(q) = heap.realloc(p, new_request) {
                        for offset in 0..request.min(new_request) {
                            assert_eq!(q.as_ptr().add(offset).read(), tag);
                        }
                        q.as_ptr().write_bytes(tag, new_request);
                        live[index as usize] = (q, new_request, tag);
                    }
                }
            },
            Trim { pad } => {
                heap.trim(pad as usize);
            }
            TuneMaxFast { request } => {
                heap.tune(Tunable::MaxFast, request as usize);
            }
            TuneMmapThreshold { kib } => {
                heap.tune(Tunable::MmapThreshold, (kib as usize + 1) * 1024);
            }
        }
    }

    // drain everything; the heap must collapse back into a single top chunk
    for (p, request, tag) in live {
        unsafe {
            for offset in 0..request {
                assert_eq!(p.as_ptr().add(offset).read(), tag);
            }
            heap.free(p);
        }
    }
    heap.trim(0);

    // fencepost slivers may survive discontiguous growth, but every mapping
    // and every fast chunk must be gone
    let stats = heap.stats();
    assert_eq!(stats.mmap_count, 0);
    assert_eq!(stats.mmapped_bytes, 0);
    assert_eq!(stats.fastbin_count, 0);

    drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(region, HEAP_SIZE)) });
});
