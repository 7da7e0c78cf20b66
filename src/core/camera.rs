//! Pinhole camera intrinsics
//!
//! Camera space follows the depth-sensor convention: +Z looks into the
//! scene, +X right, +Y down. Poses handed to the volume are camera-to-world
//! rigid transforms.

use serde::{Deserialize, Serialize};

use crate::core::types::{Vec2, Vec3};

/// Pinhole intrinsics for a `width × height` image.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PinholeIntrinsics {
    pub width: u32,
    pub height: u32,
    /// Focal length in pixels (x)
    pub fx: f32,
    /// Focal length in pixels (y)
    pub fy: f32,
    /// Principal point (x)
    pub cx: f32,
    /// Principal point (y)
    pub cy: f32,
}

impl PinholeIntrinsics {
    pub fn new(width: u32, height: u32, fx: f32, fy: f32, cx: f32, cy: f32) -> Self {
        Self { width, height, fx, fy, cx, cy }
    }

    /// 640x480 structured-light sensor defaults (fx = fy = 525).
    pub fn prime_sense() -> Self {
        Self::new(640, 480, 525.0, 525.0, 319.5, 239.5)
    }

    /// Same field of view at a different resolution.
    pub fn scaled(&self, width: u32, height: u32) -> Self {
        let sx = width as f32 / self.width as f32;
        let sy = height as f32 / self.height as f32;
        Self {
            width,
            height,
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: (self.cx + 0.5) * sx - 0.5,
            cy: (self.cy + 0.5) * sy - 0.5,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Project a camera-space point to pixel coordinates.
    /// Returns None for points at or behind the camera plane.
    pub fn project(&self, p: Vec3) -> Option<Vec2> {
        if p.z <= 0.0 {
            return None;
        }
        Some(Vec2::new(
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        ))
    }

    /// Project and round to the nearest pixel, rejecting points outside the image.
    pub fn project_to_pixel(&self, p: Vec3) -> Option<(u32, u32)> {
        let uv = self.project(p)?;
        let u = uv.x.round();
        let v = uv.y.round();
        if u < 0.0 || v < 0.0 || u >= self.width as f32 || v >= self.height as f32 {
            return None;
        }
        Some((u as u32, v as u32))
    }

    /// Back-project pixel `(u, v)` at depth `z` into camera space.
    pub fn unproject(&self, u: f32, v: f32, z: f32) -> Vec3 {
        Vec3::new((u - self.cx) * z / self.fx, (v - self.cy) * z / self.fy, z)
    }

    /// Camera-space ray through pixel `(u, v)`, scaled so that `z == 1`.
    pub fn ray_z1(&self, u: f32, v: f32) -> Vec3 {
        self.unproject(u, v, 1.0)
    }

    pub fn validate(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.fx.is_finite()
            && self.fy.is_finite()
            && self.fx > 0.0
            && self.fy > 0.0
            && self.cx.is_finite()
            && self.cy.is_finite()
    }
}

impl Default for PinholeIntrinsics {
    fn default() -> Self {
        Self::prime_sense()
    }
}
