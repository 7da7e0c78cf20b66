//! Read access to fused voxels through the directory.
//!
//! Stages that walk space coherently (rays, marching-cubes cells) hit the
//! same block many times in a row, so the sampler remembers its last
//! directory lookup.

use glam::{IVec3, Vec3};

use crate::voxel::block::{split_voxel, BlockKey, VoxelBlock};
use crate::voxel::directory::BlockHashDirectory;
use crate::voxel::pool::VoxelBlockPool;
use crate::voxel::voxel::Voxel;

/// Per-thread view of the volume's voxels, in voxel lattice coordinates
pub struct VoxelSampler<'a> {
    directory: &'a BlockHashDirectory,
    pool: &'a VoxelBlockPool,
    voxel_size: f32,
    last: Option<(BlockKey, Option<&'a VoxelBlock>)>,
}

impl<'a> VoxelSampler<'a> {
    pub fn new(directory: &'a BlockHashDirectory, pool: &'a VoxelBlockPool, voxel_size: f32) -> Self {
        Self {
            directory,
            pool,
            voxel_size,
            last: None,
        }
    }

    /// Block stored under `key`, if allocated
    pub fn block(&mut self, key: BlockKey) -> Option<&'a VoxelBlock> {
        if let Some((cached, block)) = self.last {
            if cached == key {
                return block;
            }
        }
        let block = self.directory.find(key).map(|slot| self.pool.block(slot));
        self.last = Some((key, block));
        block
    }

    /// Voxel at lattice index `g`; None when its block is unallocated
    pub fn voxel(&mut self, g: IVec3) -> Option<&'a Voxel> {
        let (key, index) = split_voxel(g);
        self.block(key).map(|block| &block.voxels[index])
    }

    /// Observed voxel at `g`
    fn observed(&mut self, g: IVec3) -> Option<&'a Voxel> {
        self.voxel(g).filter(|v| v.is_observed())
    }

    /// Trilinear TSDF at volume-frame point `p` (meters). None unless all
    /// eight surrounding voxel centers are observed.
    pub fn tsdf(&mut self, p: Vec3) -> Option<f32> {
        let q = p / self.voxel_size - Vec3::splat(0.5);
        let base = q.floor();
        let f = q - base;
        let g0 = base.as_ivec3();

        let mut c = [0.0f32; 8];
        for (i, value) in c.iter_mut().enumerate() {
            let offset = IVec3::new((i & 1) as i32, ((i >> 1) & 1) as i32, ((i >> 2) & 1) as i32);
            *value = self.observed(g0 + offset)?.tsdf;
        }

        let x00 = c[0] + (c[1] - c[0]) * f.x;
        let x10 = c[2] + (c[3] - c[2]) * f.x;
        let x01 = c[4] + (c[5] - c[4]) * f.x;
        let x11 = c[6] + (c[7] - c[6]) * f.x;
        let y0 = x00 + (x10 - x00) * f.y;
        let y1 = x01 + (x11 - x01) * f.y;
        Some(y0 + (y1 - y0) * f.z)
    }

    /// Central-difference gradient of the trilinear TSDF (volume frame,
    /// unnormalized). Points from inside towards free space.
    pub fn gradient(&mut self, p: Vec3) -> Option<Vec3> {
        let h = self.voxel_size;
        let mut g = Vec3::ZERO;
        for axis in 0..3 {
            let mut d = Vec3::ZERO;
            d[axis] = h;
            g[axis] = (self.tsdf(p + d)? - self.tsdf(p - d)?) / (2.0 * h);
        }
        Some(g)
    }

    /// Center of voxel `g` in the volume frame
    pub fn voxel_center(&self, g: IVec3) -> Vec3 {
        (g.as_vec3() + Vec3::splat(0.5)) * self.voxel_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel::block::BLOCK_SIZE;

    const VOXEL: f32 = 0.1;

    /// Two adjacent blocks along x filled with tsdf = x (meters)
    fn ramp() -> (BlockHashDirectory, VoxelBlockPool) {
        let dir = BlockHashDirectory::new(8, 2, 2, 8);
        let mut pool = VoxelBlockPool::new(4, 1 << 30).unwrap();
        for bx in 0..2 {
            let key = BlockKey::new(bx, 0, 0);
            let slot = dir.insert(key, &pool).unwrap().slot();
            let block = pool.block_mut(slot);
            for z in 0..BLOCK_SIZE {
                for y in 0..BLOCK_SIZE {
                    for x in 0..BLOCK_SIZE {
                        let gx = bx as usize * BLOCK_SIZE + x;
                        let center = (gx as f32 + 0.5) * VOXEL;
                        *block.get_mut(x, y, z) = Voxel::new(center, 1.0, [10, 20, 30]);
                    }
                }
            }
        }
        (dir, pool)
    }

    #[test]
    fn test_voxel_lookup_across_blocks() {
        let (dir, pool) = ramp();
        let mut sampler = VoxelSampler::new(&dir, &pool, VOXEL);
        assert!(sampler.voxel(IVec3::new(3, 1, 1)).is_some());
        assert!(sampler.voxel(IVec3::new(12, 1, 1)).is_some());
        assert!(sampler.voxel(IVec3::new(-1, 1, 1)).is_none());
        assert!(sampler.voxel(IVec3::new(3, 9, 1)).is_none());
    }

    #[test]
    fn test_trilinear_reproduces_linear_field() {
        let (dir, pool) = ramp();
        let mut sampler = VoxelSampler::new(&dir, &pool, VOXEL);
        // Straddles the seam between the two blocks
        let p = Vec3::new(0.83, 0.31, 0.42);
        let value = sampler.tsdf(p).unwrap();
        assert!((value - p.x).abs() < 1e-5, "got {}", value);
    }

    #[test]
    fn test_trilinear_needs_all_corners() {
        let (dir, pool) = ramp();
        let mut sampler = VoxelSampler::new(&dir, &pool, VOXEL);
        // Below the first voxel center, the -x corner block is missing
        assert!(sampler.tsdf(Vec3::new(0.02, 0.3, 0.3)).is_none());
    }

    #[test]
    fn test_gradient_of_ramp() {
        let (dir, pool) = ramp();
        let mut sampler = VoxelSampler::new(&dir, &pool, VOXEL);
        let g = sampler.gradient(Vec3::new(0.8, 0.4, 0.4)).unwrap();
        assert!((g - Vec3::X).length() < 1e-3, "got {:?}", g);
    }
}
