//! Axis-aligned boxes in the volume frame

use crate::core::types::Vec3;

/// Closed box `[min, max]`
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Cube spanning `min .. min + edge` on every axis, e.g. one voxel block
    pub fn from_cube(min: Vec3, edge: f32) -> Self {
        Self::new(min, min + Vec3::splat(edge))
    }

    /// Tightest box around a point set, `None` when the set is empty
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let mut points = points.into_iter();
        let first = points.next()?;
        Some(points.fold(Self::new(first, first), |acc, p| {
            Self::new(acc.min.min(p), acc.max.max(p))
        }))
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Inclusive on every face
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    /// Smallest box holding both
    pub fn merged(&self, other: &Aabb) -> Aabb {
        Self::new(self.min.min(other.min), self.max.max(other.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_cube() {
        let block = Aabb::from_cube(Vec3::new(-0.08, 0.0, 0.16), 0.08);
        assert!((block.center() - Vec3::new(-0.04, 0.04, 0.2)).length() < 1e-6);
        assert!((block.size() - Vec3::splat(0.08)).length() < 1e-6);
    }

    #[test]
    fn test_faces_are_inclusive() {
        let block = Aabb::from_cube(Vec3::ZERO, 1.0);
        assert!(block.contains_point(Vec3::new(1.0, 0.0, 0.5)));
        assert!(!block.contains_point(Vec3::new(1.0001, 0.5, 0.5)));
    }

    #[test]
    fn test_merge_block_bounds() {
        let a = Aabb::from_cube(Vec3::ZERO, 1.0);
        let b = Aabb::from_cube(Vec3::new(-2.0, 3.0, 0.0), 1.0);
        assert_eq!(a.merged(&b), Aabb::new(Vec3::new(-2.0, 0.0, 0.0), Vec3::new(1.0, 4.0, 1.0)));
        assert_eq!(b.merged(&a), a.merged(&b));
    }

    #[test]
    fn test_from_points() {
        assert!(Aabb::from_points(std::iter::empty()).is_none());
        let bounds = Aabb::from_points([
            Vec3::new(0.5, -1.0, 2.0),
            Vec3::new(-0.5, 1.0, 0.0),
            Vec3::ZERO,
        ])
        .unwrap();
        assert_eq!(bounds, Aabb::new(Vec3::new(-0.5, -1.0, 0.0), Vec3::new(0.5, 1.0, 2.0)));
    }
}
