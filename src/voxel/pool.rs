//! Voxel block pool - fixed-capacity storage for allocated blocks
//!
//! - Fixed capacity chosen at construction, never grown
//! - Slots handed out through a lock-free free-list
//! - No eviction: an empty free-list is an allocation failure
//!
//! Free slots always hold [`VoxelBlock::EMPTY`]; slots are cleared when
//! they are returned through `&mut self`, so a freshly acquired slot is
//! ready for fusion.

use rayon::prelude::*;

use crate::core::error::Error;
use crate::core::types::Result;
use super::block::VoxelBlock;
use super::free_list::FreeList;

/// Index of a block slot in the pool
pub type SlotIndex = u32;

/// Preallocated voxel blocks plus a free-list of slots
pub struct VoxelBlockPool {
    /// Block storage indexed by slot
    blocks: Vec<VoxelBlock>,
    /// Slots not bound to any directory entry
    free: FreeList,
}

impl VoxelBlockPool {
    /// Bytes needed for `capacity` blocks
    pub fn required_bytes(capacity: usize) -> u64 {
        capacity as u64 * (std::mem::size_of::<VoxelBlock>() + std::mem::size_of::<u32>()) as u64
    }

    /// Create a pool with `capacity` blocks.
    ///
    /// Fails with `OutOfMemory` if the storage exceeds `memory_budget` bytes
    /// or the allocator refuses it.
    pub fn new(capacity: usize, memory_budget: u64) -> Result<Self> {
        let bytes = Self::required_bytes(capacity);
        if bytes > memory_budget {
            return Err(Error::OutOfMemory(format!(
                "pool of {} blocks needs {}MB, budget is {}MB",
                capacity,
                bytes / 1024 / 1024,
                memory_budget / 1024 / 1024
            )));
        }

        let mut blocks = Vec::new();
        blocks.try_reserve_exact(capacity).map_err(|e| {
            Error::OutOfMemory(format!("pool of {} blocks: {}", capacity, e))
        })?;
        blocks.resize(capacity, VoxelBlock::EMPTY);

        log::info!(
            "Created voxel block pool: {} slots, {}MB",
            capacity,
            bytes / 1024 / 1024
        );

        Ok(Self {
            blocks,
            free: FreeList::full(capacity),
        })
    }

    /// Take a free slot. Safe under many concurrent callers.
    pub fn acquire(&self) -> Result<SlotIndex> {
        self.free.pop().ok_or_else(|| {
            Error::OutOfMemory(format!("all {} voxel blocks in use", self.capacity()))
        })
    }

    /// Return a slot that was acquired but never written.
    pub fn release(&self, slot: SlotIndex) {
        debug_assert!(self.blocks[slot as usize].is_empty(), "released slot {} holds data", slot);
        self.free.push(slot);
    }

    /// Wipe a slot's voxels and return it to the free-list.
    pub fn clear_and_release(&mut self, slot: SlotIndex) {
        self.blocks[slot as usize] = VoxelBlock::EMPTY;
        self.free.push(slot);
    }

    /// Wipe every block and mark every slot free.
    pub fn reset(&mut self) {
        self.blocks.par_iter_mut().for_each(|block| {
            if !block.is_empty() {
                *block = VoxelBlock::EMPTY;
            }
        });
        self.free.refill();
    }

    pub fn block(&self, slot: SlotIndex) -> &VoxelBlock {
        &self.blocks[slot as usize]
    }

    pub fn block_mut(&mut self, slot: SlotIndex) -> &mut VoxelBlock {
        &mut self.blocks[slot as usize]
    }

    /// All block storage, indexed by slot
    pub fn blocks_mut(&mut self) -> &mut [VoxelBlock] {
        &mut self.blocks
    }

    /// Get capacity
    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    /// Number of free slots
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Number of slots in use. Approximate while slots are being acquired
    /// or released concurrently.
    pub fn in_use(&self) -> usize {
        self.capacity().saturating_sub(self.available())
    }

    /// Get pool utilization percentage
    pub fn utilization(&self) -> f32 {
        if self.capacity() == 0 {
            return 100.0;
        }
        self.in_use() as f32 / self.capacity() as f32 * 100.0
    }
}
