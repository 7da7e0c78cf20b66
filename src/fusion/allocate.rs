//! Touch and allocation stage.
//!
//! Touch walks each valid depth pixel's ray through the truncation band
//! `[d - mu, d + mu]` and collects the blocks it crosses. Allocation then
//! claims a directory entry and pool slot for every touched block, in
//! parallel.

use std::collections::HashSet;

use rayon::prelude::*;

use crate::core::config::VolumeConfig;
use crate::core::types::Result;
use crate::frame::DepthFrame;
use crate::math::Frustum;
use crate::voxel::block::BlockKey;
use crate::voxel::directory::{BlockHashDirectory, Insertion};
use crate::voxel::pool::{SlotIndex, VoxelBlockPool};
use super::CameraView;

/// Outcome of allocating one frame's touched blocks
#[derive(Clone, Debug, Default)]
pub struct Allocation {
    /// Touched blocks with their slots, in morton order
    pub active: Vec<(BlockKey, SlotIndex)>,
    /// How many of them were newly allocated
    pub newly_allocated: usize,
}

/// Blocks crossed by the truncation band of every valid pixel, culled to
/// the camera frustum. Sorted by morton code.
pub fn touch_blocks(depth: &DepthFrame, view: &CameraView, config: &VolumeConfig) -> Vec<BlockKey> {
    let mu = config.sdf_trunc;
    let block_length = config.block_length();
    let frustum = Frustum::from_pinhole(
        view.intrinsics,
        &view.camera_to_volume,
        config.min_depth,
        config.max_depth + mu,
    );
    let width = depth.width;

    let touched = (0..depth.height)
        .into_par_iter()
        .fold(HashSet::new, |mut keys: HashSet<BlockKey>, v| {
            for u in 0..width {
                let d = depth.get(u, v);
                if d < config.min_depth || d > config.max_depth || d <= 0.0 {
                    continue;
                }

                let ray = view.intrinsics.ray_z1(u as f32, v as f32);
                // Step in camera z so that consecutive samples are half a block apart
                let step = 0.5 * block_length / ray.length();
                let steps = ((2.0 * mu / step).ceil() as usize).max(1);
                let z_near = (d - mu).max(f32::EPSILON);
                let span = (d + mu) - z_near;

                for i in 0..=steps {
                    let z = z_near + span * i as f32 / steps as f32;
                    let p = view.camera_to_volume.transform_point3(ray * z);
                    let key = BlockKey::from_point(p, block_length);
                    if key.is_representable() {
                        keys.insert(key);
                    }
                }
            }
            keys
        })
        .reduce(HashSet::new, |mut a, b| {
            a.extend(b);
            a
        });

    let mut keys: Vec<BlockKey> = touched
        .into_iter()
        .filter(|key| frustum.intersects_aabb(&key.bounds(block_length)))
        .collect();
    keys.par_sort_unstable_by_key(|key| key.morton());
    log::trace!("Touched {} blocks", keys.len());
    keys
}

/// Bind every key to a pool slot. Keys already present keep their slot.
///
/// The first failure aborts the frame. Entries claimed before the failure
/// stay allocated with empty blocks.
pub fn allocate_blocks(
    keys: &[BlockKey],
    directory: &BlockHashDirectory,
    pool: &VoxelBlockPool,
) -> Result<Allocation> {
    let inserted: Vec<(BlockKey, Insertion)> = keys
        .par_iter()
        .map(|&key| directory.insert(key, pool).map(|insertion| (key, insertion)))
        .collect::<Result<_>>()?;

    let newly_allocated = inserted.iter().filter(|(_, insertion)| insertion.is_new()).count();
    Ok(Allocation {
        active: inserted.into_iter().map(|(key, insertion)| (key, insertion.slot())).collect(),
        newly_allocated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::camera::PinholeIntrinsics;
    use crate::core::error::Error;
    use glam::{Mat4, Vec3};

    fn camera() -> PinholeIntrinsics {
        PinholeIntrinsics::new(32, 24, 30.0, 30.0, 15.5, 11.5)
    }

    fn config() -> VolumeConfig {
        VolumeConfig::with_voxel_size(0.02).depth_range(0.1, 3.0)
    }

    #[test]
    fn test_touch_covers_band_of_flat_wall() {
        let k = camera();
        let view = CameraView::new(&k, &Mat4::IDENTITY, &Mat4::IDENTITY);
        let config = config();
        let depth = DepthFrame::new(32, 24, vec![1.0; 32 * 24]).unwrap();

        let keys = touch_blocks(&depth, &view, &config);
        assert!(!keys.is_empty());

        let block_length = config.block_length();
        for key in &keys {
            let bounds = key.bounds(block_length);
            // Every block reaches into the band around z = 1
            assert!(bounds.max.z >= 1.0 - config.sdf_trunc - 1e-4);
            assert!(bounds.min.z <= 1.0 + config.sdf_trunc + 1e-4);
        }
        // The block holding the wall point on the optical axis is touched
        assert!(keys.contains(&BlockKey::from_point(Vec3::new(0.0, 0.0, 1.0), block_length)));

        let unique: HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
    }

    #[test]
    fn test_touch_skips_invalid_depth() {
        let k = camera();
        let view = CameraView::new(&k, &Mat4::IDENTITY, &Mat4::IDENTITY);
        let mut data = vec![0.0; 32 * 24];
        // Too near, too far, and one valid pixel
        data[0] = 0.05;
        data[1] = 10.0;
        data[12 * 32 + 16] = 1.5;
        let depth = DepthFrame::new(32, 24, data).unwrap();

        let keys = touch_blocks(&depth, &view, &config());
        assert!(!keys.is_empty());
        assert!(keys.len() <= 4, "single pixel touched {} blocks", keys.len());
        assert!(touch_blocks(&DepthFrame::empty(32, 24), &view, &config()).is_empty());
    }

    #[test]
    fn test_allocate_is_idempotent_across_frames() {
        let dir = BlockHashDirectory::new(64, 2, 4, 64);
        let pool = VoxelBlockPool::new(128, 1 << 30).unwrap();
        let keys: Vec<BlockKey> = (0..20).map(|i| BlockKey::new(i, 0, 1)).collect();

        let first = allocate_blocks(&keys, &dir, &pool).unwrap();
        assert_eq!(first.newly_allocated, 20);
        let second = allocate_blocks(&keys, &dir, &pool).unwrap();
        assert_eq!(second.newly_allocated, 0);
        assert_eq!(first.active, second.active);
        assert_eq!(dir.len(), 20);
    }

    #[test]
    fn test_allocate_fails_when_pool_exhausted() {
        let dir = BlockHashDirectory::new(64, 2, 4, 64);
        let pool = VoxelBlockPool::new(5, 1 << 30).unwrap();
        let keys: Vec<BlockKey> = (0..20).map(|i| BlockKey::new(0, i, 0)).collect();

        let err = allocate_blocks(&keys, &dir, &pool).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory(_)));
        assert!(dir.len() <= 5);
        assert_eq!(dir.len(), pool.in_use());
    }
}
