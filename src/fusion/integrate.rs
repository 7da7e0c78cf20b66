//! Integration stage: fuse one frame into every active block.
//!
//! Each voxel center is projected into the depth image and updated with
//! the projective signed distance `d - z` along the optical axis.
//! Voxels more than `mu` behind the observed surface are left alone.

use rayon::prelude::*;

use crate::core::config::VolumeConfig;
use crate::frame::RgbdFrame;
use crate::voxel::block::{local_coords, BlockKey, VoxelBlock};
use crate::voxel::pool::{SlotIndex, VoxelBlockPool};
use super::CameraView;

/// Fuse `frame` into the blocks of `active`. Returns the number of voxels
/// that received a non-zero-weight observation.
///
/// Every block is one rayon work unit, so no two units touch the same
/// voxel.
pub fn integrate_blocks(
    pool: &mut VoxelBlockPool,
    active: &[(BlockKey, SlotIndex)],
    frame: &RgbdFrame,
    view: &CameraView,
    config: &VolumeConfig,
) -> usize {
    let mut by_slot: Vec<Option<BlockKey>> = vec![None; pool.capacity()];
    for &(key, slot) in active {
        by_slot[slot as usize] = Some(key);
    }

    pool.blocks_mut()
        .par_iter_mut()
        .zip(by_slot.par_iter())
        .filter_map(|(block, key)| key.map(|key| (block, key)))
        .map(|(block, key)| integrate_block(block, key, frame, view, config))
        .sum()
}

fn integrate_block(
    block: &mut VoxelBlock,
    key: BlockKey,
    frame: &RgbdFrame,
    view: &CameraView,
    config: &VolumeConfig,
) -> usize {
    let mu = config.sdf_trunc;
    let first = key.first_voxel();
    let color = frame.color.as_ref().filter(|_| config.integrate_color);
    let mut updated = 0;

    for (index, voxel) in block.voxels.iter_mut().enumerate() {
        let (x, y, z) = local_coords(index);
        let g = first + glam::IVec3::new(x as i32, y as i32, z as i32);
        let center = (g.as_vec3() + 0.5) * config.voxel_size;
        let p = view.volume_to_camera.transform_point3(center);

        let Some((u, v)) = view.intrinsics.project_to_pixel(p) else {
            continue;
        };
        let d = frame.depth.get(u, v);
        if d <= 0.0 || d < config.min_depth || d > config.max_depth {
            continue;
        }

        let sdf = d - p.z;
        if sdf < -mu {
            continue;
        }
        let w_obs = config.weight_model.weight(d, config.min_depth);
        if w_obs <= 0.0 {
            continue;
        }
        let tsdf_obs = sdf.min(mu) / mu;
        voxel.fuse(tsdf_obs, w_obs, color.map(|c| c.get(u, v)));
        updated += 1;
    }
    updated
}
