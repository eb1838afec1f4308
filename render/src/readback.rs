//! Readback buffer pool.
//!
//! Transient CPU-mappable memory for GPU→CPU downloads. The pool owns a
//! set of heaps (backend buffers with a persistent mapping) and carves
//! blocks out of per-heap free lists:
//!
//! - heap selection is best global fit: the heap with the smallest
//!   `largest_size` still able to satisfy the request;
//! - block selection within a heap is best fit;
//! - freed blocks are coalesced with adjacent free neighbors, so heaps
//!   converge back to a single free block instead of fragmenting over a
//!   program's lifetime.
//!
//! Heaps grow geometrically (`max(size, 2 × next_heap_size)`) and are
//! never resized or returned to the backend until the pool drops. Freed
//! blocks go back to the free lists, not to the OS, which is what makes
//! high-frequency download staging cheap.
//!
//! The pool is single-writer by contract: the device wraps it in a mutex
//! and drives it from the download path.

use std::sync::Arc;

use crate::backend::{GpuBackend, GpuObject, MappedPtr};
use crate::error::DeviceError;

/// Initial heap size: 5 MiB.
pub const INITIAL_POOL_SIZE: u64 = 5 * 1024 * 1024;

/// A CPU-mappable block handed out by the pool.
///
/// The mapped pointer stays valid until the block is freed; the heap
/// behind it lives as long as the pool.
#[derive(Debug, Clone, Copy)]
pub struct ReadbackBlock {
    pub offset: u64,
    pub size: u64,
    pub mapped: MappedPtr,
    pub allocation_id: u64,
    pub heap_index: u16,
}

impl ReadbackBlock {
    /// View the block's bytes.
    ///
    /// # Safety
    ///
    /// The caller must ensure the GPU work filling the block has retired
    /// (fence observed signaled) and the block has not been freed.
    pub unsafe fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.mapped.0, self.size as usize) }
    }
}

struct HeapState {
    buffer: crate::backend::GpuBuffer,
    size: u64,
    /// Largest free block in this heap; used to prune heap selection.
    largest_size: u64,
    /// Unordered free list. Entries never overlap; their union plus the
    /// outstanding allocations exactly covers `[0, size)`.
    free_blocks: Vec<ReadbackBlock>,
}

/// Heap-growing, best-fit, coalescing allocator for readback staging.
pub struct ReadbackBufferPool {
    backend: Arc<dyn GpuBackend>,
    heaps: Vec<HeapState>,
    next_heap_size: u64,
    next_alloc_id: u64,
}

impl ReadbackBufferPool {
    /// Create the pool with its initial heap.
    pub fn new(backend: Arc<dyn GpuBackend>) -> Result<Self, DeviceError> {
        let mut pool = Self {
            backend,
            heaps: Vec::new(),
            next_heap_size: INITIAL_POOL_SIZE,
            next_alloc_id: 0,
        };
        pool.create_new_heap(INITIAL_POOL_SIZE)?;
        Ok(pool)
    }

    fn create_new_heap(&mut self, size: u64) -> Result<(), DeviceError> {
        let heap_index = self.heaps.len() as u16;
        let heap = self.backend.create_readback_heap(size)?;
        let block = ReadbackBlock {
            offset: 0,
            size,
            mapped: heap.mapped,
            allocation_id: self.next_alloc_id,
            heap_index,
        };
        self.next_alloc_id += 1;
        self.heaps.push(HeapState {
            buffer: heap.buffer,
            size,
            largest_size: size,
            free_blocks: vec![block],
        });
        log::debug!("readback pool: created heap {heap_index} ({size} bytes)");
        Ok(())
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// Never returns a too-small block; the only failure mode is heap
    /// creation failing when growth is required.
    pub fn allocate(&mut self, size: u64) -> Result<ReadbackBlock, DeviceError> {
        debug_assert!(size > 0, "zero-size readback allocation");

        // Best global fit: smallest largest_size that still satisfies.
        let mut selected = None;
        for heap_index in 0..self.heaps.len() {
            let largest = self.heaps[heap_index].largest_size;
            if largest >= size {
                match selected {
                    Some(s) if self.heaps[s as usize].largest_size <= largest => {}
                    _ => selected = Some(heap_index as u16),
                }
            }
        }

        let selected = match selected {
            Some(index) => index,
            None => {
                self.next_heap_size = (2 * self.next_heap_size).max(size);
                self.create_new_heap(self.next_heap_size)?;
                (self.heaps.len() - 1) as u16
            }
        };

        let heap = &mut self.heaps[selected as usize];

        // Best fit within the heap.
        let mut best_spot: Option<usize> = None;
        for (spot_index, free_spot) in heap.free_blocks.iter().enumerate() {
            if free_spot.size >= size {
                match best_spot {
                    Some(b) if heap.free_blocks[b].size <= free_spot.size => {}
                    _ => best_spot = Some(spot_index),
                }
            }
        }
        let Some(best_spot) = best_spot else {
            // largest_size said this heap could satisfy the request.
            return Err(DeviceError::Internal(
                "readback heap free list inconsistent".to_string(),
            ));
        };

        let mut block = heap.free_blocks[best_spot];
        let found_size = block.size;

        // Carve the requested prefix off; the remainder (if any) replaces
        // the free entry in place.
        let mut remainder = block;
        remainder.size -= size;
        remainder.offset += size;
        remainder.mapped = unsafe { remainder.mapped.add(size) };
        block.size = size;
        block.allocation_id = self.next_alloc_id;
        self.next_alloc_id += 1;

        if remainder.size == 0 {
            heap.free_blocks.swap_remove(best_spot);
        } else {
            heap.free_blocks[best_spot] = remainder;
        }

        // Only rescan when the consumed block was the cached maximum.
        if found_size == heap.largest_size {
            heap.largest_size = heap.free_blocks.iter().map(|b| b.size).max().unwrap_or(0);
        }

        Ok(block)
    }

    /// Return a block to its heap, merging with adjacent free blocks.
    pub fn free(&mut self, block: ReadbackBlock) {
        let heap_index = block.heap_index as usize;
        debug_assert!(heap_index < self.heaps.len(), "corrupted heap index");
        let Some(heap) = self.heaps.get_mut(heap_index) else {
            return;
        };

        let free_blocks = &mut heap.free_blocks;
        let mut before_index = None;
        let mut after_index = None;
        for (i, candidate) in free_blocks.iter().enumerate() {
            if before_index.is_none() && candidate.offset + candidate.size == block.offset {
                before_index = Some(i);
            }
            if after_index.is_none() && block.offset + block.size == candidate.offset {
                after_index = Some(i);
            }
            if before_index.is_some() && after_index.is_some() {
                break;
            }
        }

        let mut merged_size = block.size;
        match (before_index, after_index) {
            (Some(before), Some(after)) => {
                let after_size = free_blocks[after].size;
                free_blocks[before].size += block.size + after_size;
                merged_size = merged_size.max(free_blocks[before].size);
                free_blocks.swap_remove(after);
            }
            (Some(before), None) => {
                free_blocks[before].size += block.size;
                merged_size = merged_size.max(free_blocks[before].size);
            }
            (None, Some(after)) => {
                let entry = &mut free_blocks[after];
                entry.size += block.size;
                entry.offset -= block.size;
                entry.mapped = unsafe { entry.mapped.sub(block.size) };
                merged_size = merged_size.max(entry.size);
            }
            (None, None) => {
                free_blocks.push(block);
            }
        }

        // Monotonic raise is safe without a rescan; merges only grow blocks.
        heap.largest_size = heap.largest_size.max(merged_size);
    }

    /// Number of heaps currently backing the pool.
    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    /// Free-block count in one heap. Test/diagnostic hook.
    pub fn free_block_count(&self, heap_index: usize) -> usize {
        self.heaps
            .get(heap_index)
            .map(|h| h.free_blocks.len())
            .unwrap_or(0)
    }

    /// Largest free block in one heap. Test/diagnostic hook.
    pub fn largest_free_block(&self, heap_index: usize) -> u64 {
        self.heaps
            .get(heap_index)
            .map(|h| h.largest_size)
            .unwrap_or(0)
    }
}

impl Drop for ReadbackBufferPool {
    fn drop(&mut self) {
        for (index, heap) in self.heaps.drain(..).enumerate() {
            if heap.free_blocks.len() != 1 || heap.free_blocks[0].size != heap.size {
                log::warn!(
                    "readback pool: heap {index} has outstanding blocks at teardown \
                     ({} free entries over {} bytes)",
                    heap.free_blocks.len(),
                    heap.size
                );
            }
            self.backend.destroy(GpuObject::Buffer(heap.buffer));
        }
    }
}
