//! Voxel blocks and block-grid coordinates.
//!
//! Coordinates live in the volume frame. Voxel `g` (integer lattice index)
//! has its center at `(g + 0.5) * voxel_size`; block `k` holds voxels
//! `k * BLOCK_SIZE .. (k + 1) * BLOCK_SIZE` on each axis.

use bytemuck::cast_slice;
use glam::{IVec3, Vec3};

use crate::math::morton::encode_morton_3d;
use crate::math::Aabb;
use super::voxel::Voxel;

/// Block edge length in voxels
pub const BLOCK_SIZE: usize = 8;

/// Voxels per block (512)
pub const VOXELS_PER_BLOCK: usize = BLOCK_SIZE * BLOCK_SIZE * BLOCK_SIZE;

/// Largest representable key magnitude on each axis (exclusive)
pub const KEY_LIMIT: i32 = 1 << 20;

const KEY_BITS: u32 = 21;
const KEY_MASK: u64 = (1 << KEY_BITS) - 1;

/// Integer coordinate identifying a block in the block grid
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockKey {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Block containing a volume-frame point
    pub fn from_point(p: Vec3, block_length: f32) -> Self {
        let b = (p / block_length).floor();
        Self::new(b.x as i32, b.y as i32, b.z as i32)
    }

    /// Block containing a voxel lattice index
    pub fn from_voxel(g: IVec3) -> Self {
        let n = BLOCK_SIZE as i32;
        Self::new(g.x.div_euclid(n), g.y.div_euclid(n), g.z.div_euclid(n))
    }

    pub fn as_ivec3(&self) -> IVec3 {
        IVec3::new(self.x, self.y, self.z)
    }

    /// Lattice index of this block's first voxel
    pub fn first_voxel(&self) -> IVec3 {
        self.as_ivec3() * BLOCK_SIZE as i32
    }

    /// Whether the key fits the packed 21-bit-per-axis representation
    pub fn is_representable(&self) -> bool {
        [self.x, self.y, self.z].iter().all(|c| (-KEY_LIMIT..KEY_LIMIT).contains(c))
    }

    /// Pack into 63 bits. Never produces `u64::MAX`.
    pub fn pack(&self) -> Option<u64> {
        if !self.is_representable() {
            return None;
        }
        let bias = |c: i32| ((c + KEY_LIMIT) as u64) & KEY_MASK;
        Some(bias(self.x) | (bias(self.y) << KEY_BITS) | (bias(self.z) << (2 * KEY_BITS)))
    }

    pub fn unpack(packed: u64) -> Self {
        let unbias = |bits: u64| (bits & KEY_MASK) as i32 - KEY_LIMIT;
        Self::new(
            unbias(packed),
            unbias(packed >> KEY_BITS),
            unbias(packed >> (2 * KEY_BITS)),
        )
    }

    /// Spatial hash (Teschner et al. primes)
    pub fn spatial_hash(&self) -> u64 {
        (self.x as i64 as u64).wrapping_mul(73_856_093)
            ^ (self.y as i64 as u64).wrapping_mul(19_349_669)
            ^ (self.z as i64 as u64).wrapping_mul(83_492_791)
    }

    /// Z-order code used to give block iteration a stable spatial order
    pub fn morton(&self) -> u64 {
        let bias = |c: i32| (c + KEY_LIMIT) as u32;
        encode_morton_3d(bias(self.x), bias(self.y), bias(self.z))
    }

    /// Volume-frame bounds of this block
    pub fn bounds(&self, block_length: f32) -> Aabb {
        Aabb::from_cube(self.as_ivec3().as_vec3() * block_length, block_length)
    }
}

/// Linear index of a voxel inside a block (x fastest)
#[inline]
pub fn local_index(x: usize, y: usize, z: usize) -> usize {
    debug_assert!(x < BLOCK_SIZE && y < BLOCK_SIZE && z < BLOCK_SIZE);
    (z * BLOCK_SIZE + y) * BLOCK_SIZE + x
}

/// Inverse of [`local_index`]
#[inline]
pub fn local_coords(index: usize) -> (usize, usize, usize) {
    (index % BLOCK_SIZE, (index / BLOCK_SIZE) % BLOCK_SIZE, index / (BLOCK_SIZE * BLOCK_SIZE))
}

/// Split a voxel lattice index into its block and in-block linear index
#[inline]
pub fn split_voxel(g: IVec3) -> (BlockKey, usize) {
    let n = BLOCK_SIZE as i32;
    let key = BlockKey::from_voxel(g);
    let local = g - key.as_ivec3() * n;
    (key, local_index(local.x as usize, local.y as usize, local.z as usize))
}

/// N×N×N block of voxels
#[derive(Clone, Debug, PartialEq)]
pub struct VoxelBlock {
    pub voxels: [Voxel; VOXELS_PER_BLOCK],
}

impl VoxelBlock {
    /// Block with every voxel unobserved
    pub const EMPTY: VoxelBlock = VoxelBlock {
        voxels: [Voxel::EMPTY; VOXELS_PER_BLOCK],
    };

    /// Get voxel at local coordinates
    pub fn get(&self, x: usize, y: usize, z: usize) -> &Voxel {
        &self.voxels[local_index(x, y, z)]
    }

    /// Get mutable voxel at local coordinates
    pub fn get_mut(&mut self, x: usize, y: usize, z: usize) -> &mut Voxel {
        &mut self.voxels[local_index(x, y, z)]
    }

    /// Number of voxels with a non-zero weight
    pub fn observed_count(&self) -> usize {
        self.voxels.iter().filter(|v| v.is_observed()).count()
    }

    /// Whether no voxel has been observed
    pub fn is_empty(&self) -> bool {
        self.voxels.iter().all(|v| !v.is_observed())
    }

    /// Raw bytes for upload to a GPU buffer
    pub fn as_bytes(&self) -> &[u8] {
        cast_slice(&self.voxels)
    }
}

impl Default for VoxelBlock {
    fn default() -> Self {
        Self::EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_roundtrip_extremes() {
        for key in [
            BlockKey::new(0, 0, 0),
            BlockKey::new(-1, 2, -3),
            BlockKey::new(KEY_LIMIT - 1, -KEY_LIMIT, 17),
        ] {
            let packed = key.pack().unwrap();
            assert_ne!(packed, u64::MAX);
            assert_eq!(BlockKey::unpack(packed), key);
        }
    }

    #[test]
    fn test_pack_rejects_out_of_range() {
        assert!(BlockKey::new(KEY_LIMIT, 0, 0).pack().is_none());
        assert!(BlockKey::new(0, -KEY_LIMIT - 1, 0).pack().is_none());
    }

    #[test]
    fn test_from_point_floors_negative() {
        let key = BlockKey::from_point(Vec3::new(-0.01, 0.05, 0.17), 0.08);
        assert_eq!(key, BlockKey::new(-1, 0, 2));
    }

    #[test]
    fn test_split_voxel() {
        let (key, index) = split_voxel(IVec3::new(-1, 8, 3));
        assert_eq!(key, BlockKey::new(-1, 1, 0));
        assert_eq!(local_coords(index), (7, 0, 3));
    }

    #[test]
    fn test_local_index_roundtrip() {
        let index = local_index(3, 5, 7);
        assert_eq!(local_coords(index), (3, 5, 7));
        assert_eq!(local_index(BLOCK_SIZE - 1, BLOCK_SIZE - 1, BLOCK_SIZE - 1), VOXELS_PER_BLOCK - 1);
    }

    #[test]
    fn test_equal_keys_hash_equal() {
        let a = BlockKey::new(4, -9, 12);
        let b = BlockKey::new(4, -9, 12);
        assert_eq!(a.spatial_hash(), b.spatial_hash());
        assert_ne!(a.spatial_hash(), BlockKey::new(-9, 4, 12).spatial_hash());
    }

    #[test]
    fn test_block_bytes() {
        let mut block = VoxelBlock::EMPTY;
        assert!(block.is_empty());
        block.get_mut(1, 2, 3).fuse(0.0, 1.0, None);
        assert_eq!(block.observed_count(), 1);
        assert_eq!(block.as_bytes().len(), VOXELS_PER_BLOCK * 12);
    }
}
