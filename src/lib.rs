//! # marl
//!
//! A boundary-tagged, binning memory allocator in the classic
//! segregated-fit mold: fast bins for small turnaround, 126 size-classed
//! bins behind an unsorted staging queue, a wilderness chunk at the heap
//! frontier, and direct anonymous mappings for very large requests.
//!
//! The allocator core, [`Marl`], is generic over a [`SystemSource`] that
//! supplies memory — the real process break and `mmap` via [`Os`], or any
//! caller-supplied region via [`ArenaSource`]. Wrap it in [`MarlLock`] for
//! use as a global allocator:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOCATOR: MarlLock<spin::Mutex<()>, Os> = Marl::new(Os).lock();
//! ```
//!
//! Single-threaded programs can substitute [`AssumeUnlockable`] for the
//! mutex. Finer-grained locking than one global lock is unsound here:
//! coalescing crosses bins.

#![cfg_attr(not(any(test, feature = "fuzzing")), no_std)]

mod bins;
mod chunk;
mod llist;
mod marl;
mod ptr_utils;
mod stats;
pub mod system;

#[cfg(feature = "lock_api")]
mod locking;
#[cfg(feature = "lock_api")]
mod sync;

pub use allocator_api2::alloc::AllocError;

pub use bins::MAX_FAST_CEILING;
pub use chunk::{MALLOC_ALIGN, MIN_CHUNK_SIZE};
pub use marl::{Marl, Tunable};
pub use stats::HeapStats;
pub use system::{ArenaSource, SystemSource};

#[cfg(unix)]
pub use system::Os;

#[cfg(feature = "lock_api")]
pub use locking::AssumeUnlockable;
#[cfg(feature = "lock_api")]
pub use sync::MarlLock;
