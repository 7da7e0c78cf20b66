//! Scalable TSDF volume - the public entry point of the fusion engine.
//!
//! Owns the hash directory, the voxel block pool and the volume pose, and
//! runs the stages over them:
//! - `integrate`: touch -> allocate -> integrate one RGB-D frame
//! - `ray_cast`: render depth, vertices and normals from any pose
//! - `extract_mesh`: marching cubes over every allocated block
//!
//! Poses are camera-to-world rigid transforms; the volume origin maps the
//! volume frame into the world.

use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::core::camera::PinholeIntrinsics;
use crate::core::config::VolumeConfig;
use crate::core::error::Error;
use crate::core::types::{is_rigid, Mat4, Result, Vec3};
use crate::frame::RgbdFrame;
use crate::math::{Aabb, Frustum};
use crate::voxel::block::{split_voxel, BlockKey, VoxelBlock};
use crate::voxel::directory::BlockHashDirectory;
use crate::voxel::pool::{SlotIndex, VoxelBlockPool};
use crate::voxel::voxel::Voxel;
use super::allocate::{allocate_blocks, touch_blocks};
use super::integrate::integrate_blocks;
use super::mesh::{extract_mesh, Mesh, MeshStats};
use super::raycast::{ray_cast, RayCastImage};
use super::CameraView;

/// What one `integrate` call did
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameStats {
    /// Blocks in the truncation band and the frustum
    pub touched_blocks: usize,
    /// Touched blocks that were not allocated before this frame
    pub new_blocks: usize,
    /// Voxels that received an observation
    pub updated_voxels: usize,
    pub elapsed: Duration,
}

/// Occupancy snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VolumeStats {
    pub allocated_blocks: usize,
    pub active_blocks: usize,
    pub pool_capacity: usize,
    /// Percent of pool slots in use
    pub pool_utilization: f32,
    pub directory_load_factor: f32,
    pub overflow_nodes_in_use: usize,
    pub frames_integrated: u64,
    /// Bytes reserved for the pool and the directory
    pub memory_bytes: u64,
}

/// Sparse voxel-hashed TSDF volume
pub struct TsdfVolume {
    config: VolumeConfig,
    /// Volume -> world
    origin: Mat4,
    /// World -> volume
    origin_inverse: Mat4,
    directory: BlockHashDirectory,
    pool: VoxelBlockPool,
    /// Blocks touched by the last integrated frame
    active: Vec<(BlockKey, SlotIndex)>,
    /// Volume-frame box around every allocated block
    bounds: Option<Aabb>,
    frame_count: u64,
}

impl TsdfVolume {
    /// Create an empty volume with fixed capacities.
    ///
    /// `origin` is the rigid volume-to-world pose.
    pub fn new(config: VolumeConfig, origin: Mat4) -> Result<Self> {
        config.validate()?;
        if !is_rigid(&origin) {
            return Err(Error::InvalidConfig("volume origin is not a rigid transform".to_string()));
        }

        let directory_bytes = BlockHashDirectory::required_bytes(&config);
        let pool_budget = config.memory_budget_bytes.checked_sub(directory_bytes).ok_or_else(|| {
            Error::OutOfMemory(format!(
                "hash directory needs {}MB, budget is {}MB",
                directory_bytes / 1024 / 1024,
                config.memory_budget_bytes / 1024 / 1024
            ))
        })?;
        let pool = VoxelBlockPool::new(config.max_blocks, pool_budget)?;
        let directory = BlockHashDirectory::from_config(&config);

        log::info!(
            "Created TSDF volume: voxel {}m, trunc {}m, {} buckets x {}, {} blocks",
            config.voxel_size,
            config.sdf_trunc,
            config.bucket_count,
            config.bucket_size,
            config.max_blocks
        );

        Ok(Self {
            origin_inverse: origin.inverse(),
            origin,
            directory,
            pool,
            active: Vec::new(),
            bounds: None,
            frame_count: 0,
            config,
        })
    }

    /// Fuse one frame seen from camera-to-world `pose`.
    ///
    /// Invalid frames are rejected before anything changes. Capacity errors
    /// abort the frame before integration: blocks claimed so far stay
    /// allocated and empty, fused data is untouched.
    pub fn integrate(
        &mut self,
        frame: &RgbdFrame,
        intrinsics: &PinholeIntrinsics,
        pose: &Mat4,
    ) -> Result<FrameStats> {
        frame.validate(intrinsics)?;
        if !is_rigid(pose) {
            return Err(Error::InvalidFrame("camera pose is not a rigid transform".to_string()));
        }

        let start = Instant::now();
        let view = CameraView::new(intrinsics, &self.origin, pose);
        let keys = touch_blocks(&frame.depth, &view, &self.config);

        let allocation = match allocate_blocks(&keys, &self.directory, &self.pool) {
            Ok(allocation) => allocation,
            Err(e) => {
                log::warn!("Frame {} dropped during allocation: {}", self.frame_count, e);
                self.active.clear();
                self.recompute_bounds();
                return Err(e);
            }
        };

        let block_length = self.config.block_length();
        for (key, _) in &allocation.active {
            let b = key.bounds(block_length);
            self.bounds = Some(self.bounds.map_or(b, |acc| acc.merged(&b)));
        }

        let updated_voxels = integrate_blocks(&mut self.pool, &allocation.active, frame, &view, &self.config);

        let stats = FrameStats {
            touched_blocks: keys.len(),
            new_blocks: allocation.newly_allocated,
            updated_voxels,
            elapsed: start.elapsed(),
        };
        self.active = allocation.active;
        self.frame_count += 1;

        log::debug!(
            "Frame {}: {} blocks touched ({} new), {} voxels updated in {:.1}ms, pool {:.1}% used",
            self.frame_count,
            stats.touched_blocks,
            stats.new_blocks,
            stats.updated_voxels,
            stats.elapsed.as_secs_f64() * 1000.0,
            self.pool.utilization()
        );
        Ok(stats)
    }

    /// Render depth, vertices and normals of the fused surface as seen
    /// from camera-to-world `pose`.
    pub fn ray_cast(&self, intrinsics: &PinholeIntrinsics, pose: &Mat4) -> Result<RayCastImage> {
        if !intrinsics.validate() {
            return Err(Error::InvalidFrame(format!("bad intrinsics {:?}", intrinsics)));
        }
        if !is_rigid(pose) {
            return Err(Error::InvalidFrame("camera pose is not a rigid transform".to_string()));
        }
        let view = CameraView::new(intrinsics, &self.origin, pose);
        let start = Instant::now();
        let image = ray_cast(&self.directory, &self.pool, self.bounds, &view, &self.origin, &self.config);
        log::debug!(
            "Ray cast {}x{}: {} hits in {:.1}ms",
            image.width,
            image.height,
            image.hit_count(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(image)
    }

    /// Triangle mesh of the fused surface in world coordinates.
    pub fn extract_mesh(&self) -> Mesh {
        self.extract_mesh_with_stats().0
    }

    pub fn extract_mesh_with_stats(&self) -> (Mesh, MeshStats) {
        let start = Instant::now();
        let (mesh, stats) = extract_mesh(&self.directory, &self.pool, &self.origin, &self.config);
        log::info!(
            "Extracted mesh: {} vertices, {} triangles from {} blocks in {:.1}ms",
            stats.vertices,
            stats.triangles,
            stats.blocks,
            start.elapsed().as_secs_f64() * 1000.0
        );
        if stats.degenerate_cells > 0 {
            log::warn!("Skipped {} degenerate cells", stats.degenerate_cells);
        }
        (mesh, stats)
    }

    /// Blocks touched by the last integrated frame
    pub fn active_blocks(&self) -> Vec<BlockKey> {
        self.active.iter().map(|(key, _)| *key).collect()
    }

    /// Every allocated block, in morton order
    pub fn allocated_blocks(&self) -> Vec<BlockKey> {
        let mut keys: Vec<BlockKey> = self.directory.entries().into_iter().map(|(key, _)| key).collect();
        keys.par_sort_unstable_by_key(|key| key.morton());
        keys
    }

    /// Allocated blocks inside the view frustum of `pose`
    pub fn blocks_in_frustum(&self, intrinsics: &PinholeIntrinsics, pose: &Mat4) -> Vec<BlockKey> {
        let view = CameraView::new(intrinsics, &self.origin, pose);
        let frustum = Frustum::from_pinhole(
            intrinsics,
            &view.camera_to_volume,
            self.config.min_depth,
            self.config.max_depth + self.config.sdf_trunc,
        );
        let block_length = self.config.block_length();
        let mut keys: Vec<BlockKey> = self
            .directory
            .entries()
            .into_par_iter()
            .filter(|(key, _)| frustum.intersects_aabb(&key.bounds(block_length)))
            .map(|(key, _)| key)
            .collect();
        keys.par_sort_unstable_by_key(|key| key.morton());
        keys
    }

    /// Copy out every allocated block with its voxels, in morton order
    pub fn download_blocks(&self) -> Vec<(BlockKey, VoxelBlock)> {
        let mut entries = self.directory.entries();
        entries.par_sort_unstable_by_key(|(key, _)| key.morton());
        entries
            .into_par_iter()
            .map(|(key, slot)| (key, self.pool.block(slot).clone()))
            .collect()
    }

    /// Voxel containing a world-space point, if its block is allocated
    pub fn voxel_at(&self, world: Vec3) -> Option<Voxel> {
        let p = self.origin_inverse.transform_point3(world);
        let g = (p / self.config.voxel_size).floor().as_ivec3();
        let (key, index) = split_voxel(g);
        let slot = self.directory.find(key)?;
        Some(self.pool.block(slot).voxels[index])
    }

    /// Drop one block and its voxels. Returns whether it was allocated.
    pub fn remove_block(&mut self, key: BlockKey) -> bool {
        let Some(slot) = self.directory.remove(key) else {
            return false;
        };
        self.pool.clear_and_release(slot);
        self.active.retain(|(k, _)| *k != key);
        self.recompute_bounds();
        true
    }

    /// Drop every block; capacities stay as configured.
    pub fn reset(&mut self) {
        self.directory.clear();
        self.pool.reset();
        self.active.clear();
        self.bounds = None;
        self.frame_count = 0;
        log::info!("Reset TSDF volume ({} block slots free)", self.pool.available());
    }

    fn recompute_bounds(&mut self) {
        let block_length = self.config.block_length();
        self.bounds = self
            .directory
            .entries()
            .into_par_iter()
            .map(|(key, _)| Some(key.bounds(block_length)))
            .reduce(|| None, |a, b| match (a, b) {
                (Some(a), Some(b)) => Some(a.merged(&b)),
                (a, None) => a,
                (None, b) => b,
            });
    }

    pub fn stats(&self) -> VolumeStats {
        VolumeStats {
            allocated_blocks: self.directory.len(),
            active_blocks: self.active.len(),
            pool_capacity: self.pool.capacity(),
            pool_utilization: self.pool.utilization(),
            directory_load_factor: self.directory.load_factor(),
            overflow_nodes_in_use: self.directory.overflow_in_use(),
            frames_integrated: self.frame_count,
            memory_bytes: VoxelBlockPool::required_bytes(self.pool.capacity())
                + BlockHashDirectory::required_bytes(&self.config),
        }
    }

    /// Volume-frame box around every allocated block
    pub fn bounds(&self) -> Option<Aabb> {
        self.bounds
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Volume -> world pose
    pub fn origin(&self) -> &Mat4 {
        &self.origin
    }

    pub fn pool(&self) -> &VoxelBlockPool {
        &self.pool
    }

    pub fn directory(&self) -> &BlockHashDirectory {
        &self.directory
    }

    /// Frames integrated since creation or the last reset
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}
