//! Core type aliases and re-exports

pub use glam::{
    Vec2, Vec3,
    Mat3, Mat4,
    IVec3,
};

/// Standard Result type for the engine
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;

/// Tolerance used when checking that a pose is a rigid transform.
pub const RIGID_EPSILON: f32 = 1e-3;

/// Check that `m` is a finite rigid transform: orthonormal rotation with
/// determinant +1 and a `[0, 0, 0, 1]` bottom row.
pub fn is_rigid(m: &Mat4) -> bool {
    if !m.is_finite() {
        return false;
    }
    let row3 = m.row(3);
    if row3.x.abs() > RIGID_EPSILON
        || row3.y.abs() > RIGID_EPSILON
        || row3.z.abs() > RIGID_EPSILON
        || (row3.w - 1.0).abs() > RIGID_EPSILON
    {
        return false;
    }
    let r = Mat3::from_mat4(*m);
    let should_be_identity = r.transpose() * r;
    if !should_be_identity.abs_diff_eq(Mat3::IDENTITY, RIGID_EPSILON) {
        return false;
    }
    (r.determinant() - 1.0).abs() <= RIGID_EPSILON
}
