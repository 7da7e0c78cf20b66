//! Rays and ray/box clipping

use crate::core::types::Vec3;
use super::aabb::Aabb;

/// Ray `origin + t * direction`.
///
/// The direction is not normalized: camera rays are built with a unit
/// z component, so `t` is the depth along the optical axis.
#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
    /// Per-axis 1/direction for the slab test
    inv_direction: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction,
            inv_direction: direction.recip(),
        }
    }

    /// Point at parameter `t`
    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Parameter interval `(enter, exit)` inside `aabb`, ignoring the sign
    /// of `t`. Axes the ray runs parallel to constrain nothing as long as
    /// the origin lies within that slab.
    fn slabs(&self, aabb: &Aabb) -> Option<(f32, f32)> {
        let mut enter = f32::NEG_INFINITY;
        let mut exit = f32::INFINITY;
        for axis in 0..3 {
            let o = self.origin[axis];
            if self.direction[axis] == 0.0 {
                if o < aabb.min[axis] || o > aabb.max[axis] {
                    return None;
                }
                continue;
            }
            let inv = self.inv_direction[axis];
            let t0 = (aabb.min[axis] - o) * inv;
            let t1 = (aabb.max[axis] - o) * inv;
            enter = enter.max(t0.min(t1));
            exit = exit.min(t0.max(t1));
        }
        (enter <= exit).then_some((enter, exit))
    }

    /// Forward part of the ray inside `aabb`, as `(t_near, t_far)` with
    /// `t_near` clamped to 0 when the origin is inside.
    pub fn intersects_aabb(&self, aabb: &Aabb) -> Option<(f32, f32)> {
        let (enter, exit) = self.slabs(aabb)?;
        (exit >= 0.0).then_some((enter.max(0.0), exit))
    }

    /// Restrict `[t_min, t_max]` to the part of the ray inside `aabb`.
    pub fn clip(&self, aabb: &Aabb, t_min: f32, t_max: f32) -> Option<(f32, f32)> {
        let (enter, exit) = self.slabs(aabb)?;
        let start = enter.max(t_min);
        let end = exit.min(t_max);
        (start <= end).then_some((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box() -> Aabb {
        Aabb::new(Vec3::ZERO, Vec3::ONE)
    }

    #[test]
    fn test_depth_parameter() {
        // Camera ray with unit z: t is the depth
        let ray = Ray::new(Vec3::ZERO, Vec3::new(0.25, -0.5, 1.0));
        assert_eq!(ray.at(2.0), Vec3::new(0.5, -1.0, 2.0));
    }

    #[test]
    fn test_enter_and_exit() {
        let ray = Ray::new(Vec3::new(0.5, 0.5, -2.0), Vec3::Z);
        let (near, far) = ray.intersects_aabb(&unit_box()).unwrap();
        assert!((near - 2.0).abs() < 1e-5);
        assert!((far - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_axis_parallel_miss() {
        let ray = Ray::new(Vec3::new(3.0, 0.5, -2.0), Vec3::Z);
        assert!(ray.intersects_aabb(&unit_box()).is_none());
    }

    #[test]
    fn test_box_behind_origin() {
        let ray = Ray::new(Vec3::new(0.5, 0.5, 2.0), Vec3::Z);
        assert!(ray.intersects_aabb(&unit_box()).is_none());

        let inside = Ray::new(Vec3::splat(0.5), Vec3::new(0.1, 0.0, 1.0));
        assert_eq!(inside.intersects_aabb(&unit_box()).unwrap().0, 0.0);
    }

    #[test]
    fn test_clip_depth_range() {
        let ray = Ray::new(Vec3::new(0.5, 0.5, -2.0), Vec3::Z);
        let (start, end) = ray.clip(&unit_box(), 2.5, 10.0).unwrap();
        assert!((start - 2.5).abs() < 1e-5);
        assert!((end - 3.0).abs() < 1e-5);
        assert!(ray.clip(&unit_box(), 0.1, 1.5).is_none());
        assert!(ray.clip(&unit_box(), 4.0, 10.0).is_none());
    }
}
