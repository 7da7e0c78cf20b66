//! Voxel storage: TSDF voxels, blocks, the block pool and the hash directory

pub mod voxel;
pub mod block;
pub mod free_list;
pub mod pool;
pub mod directory;

pub use voxel::Voxel;
pub use block::{BlockKey, VoxelBlock, BLOCK_SIZE, VOXELS_PER_BLOCK};
pub use pool::{SlotIndex, VoxelBlockPool};
pub use directory::{BlockHashDirectory, Insertion};
