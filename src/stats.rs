//! Point-in-time statistics for a [`Marl`] heap.

use crate::bins::{NBINS, UNSORTED_BIN};
use crate::chunk::Chunk;
use crate::llist::LlistNode;
use crate::marl::Marl;
use crate::system::SystemSource;

/// A snapshot of the allocator's occupancy counters.
///
/// Produced by [`Marl::stats`]; all byte figures are chunk sizes, overhead
/// included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Number of chunks resident in fast bins.
    pub fastbin_count: usize,
    /// Bytes resident in fast bins.
    pub fastbin_bytes: usize,
    /// Number of ordinary free chunks, the top chunk included.
    pub free_count: usize,
    /// Bytes in ordinary free chunks, the top chunk included.
    pub free_bytes: usize,
    /// Heap bytes currently allocated.
    pub in_use_bytes: usize,
    /// Bytes obtained by contiguous extension.
    pub sbrked_bytes: usize,
    /// Number of live direct mappings.
    pub mmap_count: usize,
    /// Bytes held in direct mappings.
    pub mmapped_bytes: usize,
    /// Bytes releasable via trimming (the size of top).
    pub keepcost: usize,
    /// High-water mark of contiguous-extension bytes.
    pub max_sbrked_bytes: usize,
    /// High-water mark of direct-mapping bytes.
    pub max_mmapped_bytes: usize,
    /// Lifetime maximum of total bytes held from the system.
    pub max_total_bytes: usize,
}

impl<S: SystemSource> Marl<S> {
    /// Take a statistics snapshot by walking the fast bins, the normal bins
    /// and top. Cost is linear in the number of free chunks.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            sbrked_bytes: self.sbrked_mem,
            mmap_count: self.n_mmaps,
            mmapped_bytes: self.mmapped_mem,
            max_sbrked_bytes: self.max_sbrked_mem,
            max_mmapped_bytes: self.max_mmapped_mem,
            max_total_bytes: self.max_total_mem,
            ..HeapStats::default()
        };

        if self.bins.is_null() {
            return stats;
        }

        unsafe {
            for &head in &self.fastbins {
                let mut cursor = head;
                while !cursor.is_null() {
                    let chunk = Chunk(cursor);
                    stats.fastbin_count += 1;
                    stats.fastbin_bytes += chunk.size();
                    cursor = chunk.fast_next();
                }
            }

            for b in UNSORTED_BIN..NBINS {
                for node in LlistNode::iter(self.bin_at(b)) {
                    stats.free_count += 1;
                    stats.free_bytes += Chunk::from_node(node).size();
                }
            }

            if let Some(top) = self.top_chunk() {
                stats.free_count += 1;
                stats.free_bytes += top.size();
                stats.keepcost = top.size();
            }
        }

        stats.in_use_bytes = self.sbrked_mem - stats.free_bytes - stats.fastbin_bytes;
        stats
    }
}
