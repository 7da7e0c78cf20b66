//! Ray-casting stage.
//!
//! Marches one ray per pixel through the fused field. Rays skip whole
//! unallocated blocks, step at a fixed fraction of a voxel through
//! allocated ones, and stop at the first front-facing zero crossing.

use rayon::prelude::*;

use crate::core::config::VolumeConfig;
use crate::core::types::{Mat3, Mat4, Vec3};
use crate::math::{Aabb, Ray};
use crate::voxel::block::BlockKey;
use crate::voxel::directory::BlockHashDirectory;
use crate::voxel::pool::VoxelBlockPool;
use super::sampler::VoxelSampler;
use super::CameraView;

/// Per-pixel ray-cast output. Row-major, `width * height` entries.
#[derive(Clone, Debug, PartialEq)]
pub struct RayCastImage {
    pub width: u32,
    pub height: u32,
    /// Camera-space z of the hit; 0 where the ray missed
    pub depth: Vec<f32>,
    /// World-space hit points (zero where missed)
    pub vertices: Vec<Vec3>,
    /// World-space unit normals (zero where missed or undefined)
    pub normals: Vec<Vec3>,
}

impl RayCastImage {
    /// Image where every ray missed
    pub fn empty(width: u32, height: u32) -> Self {
        let n = width as usize * height as usize;
        Self {
            width,
            height,
            depth: vec![0.0; n],
            vertices: vec![Vec3::ZERO; n],
            normals: vec![Vec3::ZERO; n],
        }
    }

    #[inline]
    fn index(&self, u: u32, v: u32) -> usize {
        v as usize * self.width as usize + u as usize
    }

    pub fn depth_at(&self, u: u32, v: u32) -> f32 {
        self.depth[self.index(u, v)]
    }

    pub fn vertex_at(&self, u: u32, v: u32) -> Option<Vec3> {
        let i = self.index(u, v);
        (self.depth[i] > 0.0).then_some(self.vertices[i])
    }

    pub fn normal_at(&self, u: u32, v: u32) -> Option<Vec3> {
        let i = self.index(u, v);
        (self.depth[i] > 0.0).then_some(self.normals[i])
    }

    /// Number of pixels whose ray hit the surface
    pub fn hit_count(&self) -> usize {
        self.depth.iter().filter(|&&d| d > 0.0).count()
    }
}

#[derive(Clone, Copy)]
struct Hit {
    depth: f32,
    vertex: Vec3,
    normal: Vec3,
}

/// Cast every pixel of `view` against the volume.
///
/// `bounds` is the volume-frame box around all allocated blocks; rays are
/// clipped to it. `volume_origin` maps hits back to world.
pub fn ray_cast(
    directory: &BlockHashDirectory,
    pool: &VoxelBlockPool,
    bounds: Option<Aabb>,
    view: &CameraView,
    volume_origin: &Mat4,
    config: &VolumeConfig,
) -> RayCastImage {
    let k = view.intrinsics;
    let Some(bounds) = bounds else {
        return RayCastImage::empty(k.width, k.height);
    };

    let width = k.width as usize;
    let to_world_rotation = Mat3::from_mat4(*volume_origin);

    let hits: Vec<Option<Hit>> = (0..k.pixel_count())
        .into_par_iter()
        .map_init(
            || VoxelSampler::new(directory, pool, config.voxel_size),
            |sampler, i| {
                let (u, v) = ((i % width) as f32, (i / width) as f32);
                march(sampler, &bounds, view, u, v, config)
            },
        )
        .collect();

    let mut image = RayCastImage::empty(k.width, k.height);
    for (i, hit) in hits.into_iter().enumerate() {
        if let Some(hit) = hit {
            image.depth[i] = hit.depth;
            image.vertices[i] = volume_origin.transform_point3(hit.vertex);
            image.normals[i] = (to_world_rotation * hit.normal).normalize_or_zero();
        }
    }
    image
}

/// March the ray through pixel `(u, v)`. Hit vertex and normal come back in
/// the volume frame.
fn march(
    sampler: &mut VoxelSampler,
    bounds: &Aabb,
    view: &CameraView,
    u: f32,
    v: f32,
    config: &VolumeConfig,
) -> Option<Hit> {
    let dir_camera = view.intrinsics.ray_z1(u, v);
    // Parameterized by camera z: at(t) is the point with depth t
    let ray = Ray::new(view.center(), view.camera_to_volume.transform_vector3(dir_camera));
    let (t_start, t_end) = ray.clip(bounds, config.min_depth, config.max_depth)?;

    let block_length = config.block_length();
    let step = config.raycast_step_factor * config.voxel_size / dir_camera.length();

    let mut t = t_start;
    let mut previous: Option<(f32, f32)> = None;
    while t <= t_end {
        let p = ray.at(t);
        let key = BlockKey::from_point(p, block_length);
        if sampler.block(key).is_none() {
            // Jump to where the ray leaves this block
            let exit = ray
                .intersects_aabb(&key.bounds(block_length))
                .map_or(t, |(_, far)| far);
            t = exit.max(t) + step;
            previous = None;
            continue;
        }

        let Some(value) = sampler.tsdf(p) else {
            previous = None;
            t += step;
            continue;
        };

        if let Some((t_prev, value_prev)) = previous {
            if value_prev > 0.0 && value <= 0.0 {
                let t_hit = t_prev + (t - t_prev) * value_prev / (value_prev - value);
                let vertex = ray.at(t_hit);
                let normal = sampler
                    .gradient(vertex)
                    .map_or(Vec3::ZERO, |g| g.normalize_or_zero());
                return Some(Hit { depth: t_hit, vertex, normal });
            }
            if value_prev < 0.0 && value > 0.0 {
                // Back side of a surface
                return None;
            }
        }
        previous = Some((t, value));
        t += step;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::camera::PinholeIntrinsics;
    use crate::voxel::block::BLOCK_SIZE;
    use crate::voxel::voxel::Voxel;

    const VOXEL: f32 = 0.02;
    const PLANE_Z: f32 = 1.0;

    fn config() -> VolumeConfig {
        VolumeConfig::with_voxel_size(VOXEL)
    }

    /// Blocks around the optical axis filled with the analytic TSDF of the
    /// plane z = PLANE_Z
    fn plane_volume(config: &VolumeConfig) -> (BlockHashDirectory, VoxelBlockPool, Aabb) {
        let dir = BlockHashDirectory::new(64, 4, 4, 64);
        let mut pool = VoxelBlockPool::new(64, 1 << 30).unwrap();
        let mu = config.sdf_trunc;
        let mut bounds: Option<Aabb> = None;
        for bx in -1..1 {
            for by in -1..1 {
                for bz in 5..7 {
                    let key = BlockKey::new(bx, by, bz);
                    let slot = dir.insert(key, &pool).unwrap().slot();
                    let block = pool.block_mut(slot);
                    for (i, voxel) in block.voxels.iter_mut().enumerate() {
                        let (_, _, lz) = crate::voxel::block::local_coords(i);
                        let gz = bz * BLOCK_SIZE as i32 + lz as i32;
                        let z = (gz as f32 + 0.5) * VOXEL;
                        let sdf = (PLANE_Z - z).clamp(-mu, mu) / mu;
                        *voxel = Voxel::new(sdf, 1.0, [0; 3]);
                    }
                    let b = key.bounds(config.block_length());
                    bounds = Some(bounds.map_or(b, |acc| acc.merged(&b)));
                }
            }
        }
        (dir, pool, bounds.unwrap())
    }

    #[test]
    fn test_plane_hit_depth_and_normal() {
        let config = config();
        let (dir, pool, bounds) = plane_volume(&config);
        let k = PinholeIntrinsics::new(16, 12, 20.0, 20.0, 7.5, 5.5);
        let view = CameraView::new(&k, &Mat4::IDENTITY, &Mat4::IDENTITY);

        let image = ray_cast(&dir, &pool, Some(bounds), &view, &Mat4::IDENTITY, &config);
        let (u, v) = (8, 6);
        let depth = image.depth_at(u, v);
        assert!((depth - PLANE_Z).abs() < VOXEL, "depth {}", depth);

        let vertex = image.vertex_at(u, v).unwrap();
        assert!((vertex.z - PLANE_Z).abs() < VOXEL);
        // Normal faces back towards the camera
        let normal = image.normal_at(u, v).unwrap();
        assert!(normal.dot(-Vec3::Z) > 0.99, "normal {:?}", normal);
    }

    #[test]
    fn test_no_bounds_means_no_hits() {
        let config = config();
        let dir = BlockHashDirectory::new(8, 1, 1, 1);
        let pool = VoxelBlockPool::new(1, 1 << 30).unwrap();
        let k = PinholeIntrinsics::new(8, 6, 10.0, 10.0, 3.5, 2.5);
        let view = CameraView::new(&k, &Mat4::IDENTITY, &Mat4::IDENTITY);
        let image = ray_cast(&dir, &pool, None, &view, &Mat4::IDENTITY, &config);
        assert_eq!(image.hit_count(), 0);
        assert_eq!(image.depth.len(), 48);
    }

    #[test]
    fn test_back_face_is_not_a_hit() {
        let config = config();
        let (dir, pool, bounds) = plane_volume(&config);
        let k = PinholeIntrinsics::new(16, 12, 20.0, 20.0, 7.5, 5.5);
        // Camera at z = 2 looking back along -z (rotated 180 degrees about y)
        let pose = Mat4::from_translation(Vec3::new(0.0, 0.0, 2.0)) * Mat4::from_rotation_y(std::f32::consts::PI);
        let view = CameraView::new(&k, &Mat4::IDENTITY, &pose);
        let image = ray_cast(&dir, &pool, Some(bounds), &view, &Mat4::IDENTITY, &config);
        assert_eq!(image.depth_at(8, 6), 0.0);
    }
}
