//! View frustum for culling

use crate::core::camera::PinholeIntrinsics;
use crate::core::types::{Mat3, Mat4, Vec3};
use super::aabb::Aabb;

/// Half-space boundary `normal . p + distance = 0`
#[derive(Clone, Copy, Debug)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    /// Plane with the given normal passing through `point`
    pub fn from_point_normal(point: Vec3, normal: Vec3) -> Self {
        Self { normal, distance: -normal.dot(point) }
    }

    /// Signed distance, positive on the side the normal points to
    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }
}

/// Camera viewing volume bounded by near, far and four side planes
#[derive(Clone, Copy, Debug)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Frustum of a pinhole camera with camera-to-world `pose`, covering
    /// depths `[near, far]` along the optical axis. Normals point inward.
    pub fn from_pinhole(intrinsics: &PinholeIntrinsics, pose: &Mat4, near: f32, far: f32) -> Self {
        let rotation = Mat3::from_mat4(*pose);
        let origin = pose.transform_point3(Vec3::ZERO);

        let w = intrinsics.width as f32 - 0.5;
        let h = intrinsics.height as f32 - 0.5;
        let corners = [
            intrinsics.ray_z1(-0.5, -0.5),
            intrinsics.ray_z1(w, -0.5),
            intrinsics.ray_z1(w, h),
            intrinsics.ray_z1(-0.5, h),
        ];
        let axis = intrinsics.ray_z1(intrinsics.cx, intrinsics.cy);

        // Side planes through the camera center and two adjacent image corners
        let side = |a: Vec3, b: Vec3| {
            let mut n = a.cross(b).normalize();
            if n.dot(axis) < 0.0 {
                n = -n;
            }
            Plane::from_point_normal(origin, rotation * n)
        };

        let forward = rotation * Vec3::Z;
        let near_plane = Plane::from_point_normal(origin + forward * near, forward);
        let far_plane = Plane::from_point_normal(origin + forward * far, -forward);

        Self {
            planes: [
                near_plane,
                far_plane,
                side(corners[3], corners[0]),
                side(corners[1], corners[2]),
                side(corners[0], corners[1]),
                side(corners[2], corners[3]),
            ],
        }
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes.iter().all(|plane| plane.distance_to_point(point) >= 0.0)
    }

    /// Conservative box test: false only when the box lies entirely behind
    /// one plane. Boxes near frustum edges may pass.
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        self.planes.iter().all(|plane| {
            let farthest = Vec3::select(plane.normal.cmpge(Vec3::ZERO), aabb.max, aabb.min);
            plane.distance_to_point(farthest) >= 0.0
        })
    }
}
