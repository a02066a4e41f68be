//! Free-list pool allocator for the UNOS kernel
//!
//! One pre-reserved arena, managed as an address-ordered free list of
//! variable-size blocks. The kernel carves its mailbox buffers and client
//! scratch memory out of this pool; the fixed kernel tables are sized at
//! boot, so a failed allocation here is fatal during initialization and
//! merely reported after it.
//!
//! Blocks are handed out as index-based [`BlockRef`] handles rather than
//! raw pointers, and all bookkeeping lives outside the arena itself.
//!
//! Allocation is next-fit: the search resumes from the most recently
//! examined free block, splitting an oversize block and returning the
//! remainder to the list. `free` links a block back in address order.
//! Freed neighbors are not coalesced; fragmentation is an accepted
//! limitation of this allocator.

#![no_std]

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

/// Allocation unit size in bytes. All block sizes are in units.
pub const UNIT: usize = 8;

/// Handle to an allocated block.
///
/// Only the pool that produced a `BlockRef` can resolve or free it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRef {
    offset: usize,
    units: usize,
}

impl BlockRef {
    /// Block offset into the arena, in units.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Block size in units.
    pub fn units(&self) -> usize {
        self.units
    }

    /// Block size in bytes.
    pub fn len_bytes(&self) -> usize {
        self.units * UNIT
    }
}

/// Pool allocator errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolError {
    /// No free block large enough for the request
    OutOfMemory,
    /// The handle does not describe a live allocation in this pool
    InvalidBlock,
}

/// One entry in the address-ordered free list.
#[derive(Clone, Copy, Debug)]
struct FreeBlock {
    offset: usize,
    units: usize,
}

/// A fixed arena with a free-list allocator over it.
pub struct Pool {
    storage: Vec<u8>,
    /// Free blocks, ordered by offset
    free: Vec<FreeBlock>,
    /// Index of the most recently examined free block; searches resume here
    rover: usize,
    free_units: usize,
    total_units: usize,
}

impl Pool {
    /// Create a pool over an arena of at least `bytes` bytes
    /// (rounded up to a whole number of units).
    pub fn new(bytes: usize) -> Self {
        let total_units = bytes.div_ceil(UNIT);
        Self {
            storage: vec![0u8; total_units * UNIT],
            free: vec![FreeBlock {
                offset: 0,
                units: total_units,
            }],
            rover: 0,
            free_units: total_units,
            total_units,
        }
    }

    /// Allocate a block of at least `bytes` bytes.
    pub fn alloc(&mut self, bytes: usize) -> Result<BlockRef, PoolError> {
        let need = bytes.div_ceil(UNIT).max(1);
        if self.free.is_empty() {
            return Err(PoolError::OutOfMemory);
        }

        if self.rover >= self.free.len() {
            self.rover = 0;
        }

        // Next-fit: scan from the rover, wrapping once over the whole list.
        let len = self.free.len();
        for step in 0..len {
            let idx = (self.rover + step) % len;
            if self.free[idx].units < need {
                continue;
            }

            let offset = self.free[idx].offset;
            if self.free[idx].units == need {
                self.free.remove(idx);
            } else {
                // Split: take the front, keep the remainder listed.
                self.free[idx].offset += need;
                self.free[idx].units -= need;
            }
            self.rover = if self.free.is_empty() {
                0
            } else {
                idx % self.free.len()
            };
            self.free_units -= need;
            return Ok(BlockRef {
                offset,
                units: need,
            });
        }

        Err(PoolError::OutOfMemory)
    }

    /// Allocate a zero-filled block for `count` elements of `elem_bytes`.
    pub fn alloc_zeroed(&mut self, count: usize, elem_bytes: usize) -> Result<BlockRef, PoolError> {
        let bytes = count
            .checked_mul(elem_bytes)
            .ok_or(PoolError::OutOfMemory)?;
        let block = self.alloc(bytes)?;
        let start = block.offset * UNIT;
        self.storage[start..start + block.units * UNIT].fill(0);
        Ok(block)
    }

    /// Return a block to the free list.
    pub fn free(&mut self, block: BlockRef) -> Result<(), PoolError> {
        if block.units == 0 || block.offset + block.units > self.total_units {
            return Err(PoolError::InvalidBlock);
        }

        // Address-ordered insert; overlap with a listed block means the
        // handle is stale or corrupt.
        let pos = self
            .free
            .partition_point(|f| f.offset < block.offset);
        if pos > 0 {
            let prev = &self.free[pos - 1];
            if prev.offset + prev.units > block.offset {
                return Err(PoolError::InvalidBlock);
            }
        }
        if pos < self.free.len() && block.offset + block.units > self.free[pos].offset {
            return Err(PoolError::InvalidBlock);
        }

        self.free.insert(
            pos,
            FreeBlock {
                offset: block.offset,
                units: block.units,
            },
        );
        // Keep the rover pinned to the block it was examining.
        if pos <= self.rover && self.free.len() > 1 {
            self.rover += 1;
        }
        self.free_units += block.units;
        Ok(())
    }

    /// Total free units across all free blocks.
    pub fn remaining_units(&self) -> usize {
        self.free_units
    }

    /// Total free bytes across all free blocks.
    pub fn remaining_bytes(&self) -> usize {
        self.free_units * UNIT
    }

    /// Arena size in units.
    pub fn total_units(&self) -> usize {
        self.total_units
    }

    /// Read access to a block's bytes.
    pub fn data(&self, block: &BlockRef) -> &[u8] {
        let start = block.offset * UNIT;
        &self.storage[start..start + block.units * UNIT]
    }

    /// Write access to a block's bytes.
    pub fn data_mut(&mut self, block: &BlockRef) -> &mut [u8] {
        let start = block.offset * UNIT;
        &mut self.storage[start..start + block.units * UNIT]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_restores_remaining() {
        let mut pool = Pool::new(1024);
        let before = pool.remaining_units();

        let block = pool.alloc(100).unwrap();
        assert!(pool.remaining_units() < before);

        pool.free(block).unwrap();
        assert_eq!(pool.remaining_units(), before);
    }

    #[test]
    fn test_split_leaves_remainder_allocatable() {
        let mut pool = Pool::new(64 * UNIT);
        let a = pool.alloc(16 * UNIT).unwrap();
        let b = pool.alloc(16 * UNIT).unwrap();
        assert_ne!(a.offset(), b.offset());
        assert_eq!(pool.remaining_units(), 32);
    }

    #[test]
    fn test_exhaustion_reports_out_of_memory() {
        let mut pool = Pool::new(8 * UNIT);
        let _a = pool.alloc(8 * UNIT).unwrap();
        assert_eq!(pool.alloc(1), Err(PoolError::OutOfMemory));
    }

    #[test]
    fn test_oversize_request_fails_without_mutation() {
        let mut pool = Pool::new(16 * UNIT);
        let before = pool.remaining_units();
        assert_eq!(pool.alloc(17 * UNIT), Err(PoolError::OutOfMemory));
        assert_eq!(pool.remaining_units(), before);
    }

    #[test]
    fn test_alloc_zeroed_clears_bytes() {
        let mut pool = Pool::new(32);
        let a = pool.alloc(32).unwrap();
        pool.data_mut(&a).fill(0xAA);
        pool.free(a).unwrap();

        let b = pool.alloc_zeroed(4, 8).unwrap();
        assert!(pool.data(&b).iter().all(|&x| x == 0));
    }

    #[test]
    fn test_data_roundtrip() {
        let mut pool = Pool::new(256);
        let block = pool.alloc(16).unwrap();
        pool.data_mut(&block)[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&pool.data(&block)[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_double_free_rejected() {
        let mut pool = Pool::new(256);
        let block = pool.alloc(16).unwrap();
        pool.free(block).unwrap();
        assert_eq!(pool.free(block), Err(PoolError::InvalidBlock));
    }

    #[test]
    fn test_free_list_stays_address_ordered() {
        let mut pool = Pool::new(64 * UNIT);
        let a = pool.alloc(8 * UNIT).unwrap();
        let b = pool.alloc(8 * UNIT).unwrap();
        let c = pool.alloc(8 * UNIT).unwrap();

        // Free out of address order; exact-fit requests must land in the
        // freed holes, not carve fresh space.
        pool.free(c).unwrap();
        pool.free(a).unwrap();
        let d = pool.alloc(40 * UNIT).unwrap();
        assert_eq!(d.offset(), 24);
        let e = pool.alloc(8 * UNIT).unwrap();
        assert_eq!(e.offset(), a.offset());

        pool.free(b).unwrap();
        pool.free(d).unwrap();
        pool.free(e).unwrap();
        assert_eq!(pool.remaining_units(), 64);
    }

    #[test]
    fn test_next_fit_resumes_after_last_block() {
        let mut pool = Pool::new(64 * UNIT);
        let a = pool.alloc(16 * UNIT).unwrap();
        let _b = pool.alloc(16 * UNIT).unwrap();
        pool.free(a).unwrap();

        // The rover sits past the freed hole, so the next allocation is
        // served from the tail region, not the hole at the arena start.
        let c = pool.alloc(8 * UNIT).unwrap();
        assert_eq!(c.offset(), 32);
    }
}
