//! Analytic depth renderers for spheres and planes.
//!
//! Produce exact depth (and simple shaded color) frames for known scenes,
//! used by the demo binary, benchmarks and tests.

use rayon::prelude::*;

use crate::core::camera::PinholeIntrinsics;
use crate::core::types::{Mat3, Mat4, Vec3};
use crate::frame::{ColorFrame, DepthFrame, RgbdFrame};

/// Camera-to-world pose of a camera at `eye` looking at `target`.
///
/// Camera axes follow the depth-sensor convention (+Z forward, +Y down).
pub fn look_at(eye: Vec3, target: Vec3) -> Mat4 {
    let forward = (target - eye).normalize();
    let up = if forward.cross(Vec3::Y).length_squared() < 1e-6 { Vec3::Z } else { Vec3::Y };
    let right = forward.cross(up).normalize();
    let down = forward.cross(right);
    Mat4::from_cols(
        right.extend(0.0),
        down.extend(0.0),
        forward.extend(0.0),
        eye.extend(1.0),
    )
}

/// `count` poses on a circle of `radius` around `center` in the XZ plane,
/// all looking at `center`, raised by `height`.
pub fn orbit_poses(center: Vec3, radius: f32, height: f32, count: usize) -> Vec<Mat4> {
    (0..count)
        .map(|i| {
            let angle = i as f32 / count as f32 * std::f32::consts::TAU;
            let eye = center + Vec3::new(radius * angle.cos(), height, radius * angle.sin());
            look_at(eye, center)
        })
        .collect()
}

/// Surface a camera ray can hit
pub trait Scene: Sync {
    /// Smallest positive ray parameter of the hit, and the surface normal
    fn intersect(&self, origin: Vec3, direction: Vec3) -> Option<(f32, Vec3)>;
}

#[derive(Clone, Copy, Debug)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

impl Scene for Sphere {
    fn intersect(&self, origin: Vec3, direction: Vec3) -> Option<(f32, Vec3)> {
        let oc = origin - self.center;
        let a = direction.length_squared();
        let b = oc.dot(direction);
        let c = oc.length_squared() - self.radius * self.radius;
        let disc = b * b - a * c;
        if disc < 0.0 {
            return None;
        }
        let sqrt = disc.sqrt();
        let t = [(-b - sqrt) / a, (-b + sqrt) / a].into_iter().find(|&t| t > 0.0)?;
        let normal = (origin + direction * t - self.center) / self.radius;
        Some((t, normal))
    }
}

/// Infinite plane through `point`
#[derive(Clone, Copy, Debug)]
pub struct Plane {
    pub point: Vec3,
    pub normal: Vec3,
}

impl Scene for Plane {
    fn intersect(&self, origin: Vec3, direction: Vec3) -> Option<(f32, Vec3)> {
        let denom = self.normal.dot(direction);
        if denom.abs() < 1e-9 {
            return None;
        }
        let t = self.normal.dot(self.point - origin) / denom;
        (t > 0.0).then_some((t, if denom < 0.0 { self.normal } else { -self.normal }))
    }
}

/// Render `scene` from a camera at `pose`. Depth is camera z in meters,
/// color encodes the world normal.
pub fn render(scene: &impl Scene, intrinsics: &PinholeIntrinsics, pose: &Mat4) -> RgbdFrame {
    let rotation = Mat3::from_mat4(*pose);
    let origin = pose.w_axis.truncate();
    let width = intrinsics.width as usize;

    let pixels: Vec<(f32, [u8; 3])> = (0..intrinsics.pixel_count())
        .into_par_iter()
        .map(|i| {
            let (u, v) = ((i % width) as f32, (i / width) as f32);
            // z = 1 in camera space, so the ray parameter is the depth
            let direction = rotation * intrinsics.ray_z1(u, v);
            match scene.intersect(origin, direction) {
                Some((t, n)) => {
                    let c = (n * 0.5 + 0.5) * 255.0;
                    (t, [c.x as u8, c.y as u8, c.z as u8])
                }
                None => (0.0, [0; 3]),
            }
        })
        .collect();

    let (depth, color): (Vec<f32>, Vec<[u8; 3]>) = pixels.into_iter().unzip();
    RgbdFrame {
        depth: DepthFrame {
            width: intrinsics.width,
            height: intrinsics.height,
            data: depth,
        },
        color: Some(ColorFrame {
            width: intrinsics.width,
            height: intrinsics.height,
            data: color,
        }),
    }
}
