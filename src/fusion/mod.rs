//! TSDF fusion stages and the volume that orchestrates them
//!
//! Per frame: touch/allocate -> integrate, then optionally ray-cast or
//! mesh. Each stage is a rayon fork-join over the shared directory and pool.

pub mod tables;
pub mod sampler;
pub mod allocate;
pub mod integrate;
pub mod raycast;
pub mod mesh;
pub mod volume;

pub use mesh::{Mesh, MeshStats, MeshVertex};
pub use raycast::RayCastImage;
pub use volume::{FrameStats, TsdfVolume, VolumeStats};

use crate::core::camera::PinholeIntrinsics;
use crate::core::types::{Mat4, Vec3};

/// A camera placed in the volume frame
#[derive(Clone, Copy, Debug)]
pub struct CameraView<'a> {
    pub intrinsics: &'a PinholeIntrinsics,
    /// Camera -> volume
    pub camera_to_volume: Mat4,
    /// Volume -> camera
    pub volume_to_camera: Mat4,
}

impl<'a> CameraView<'a> {
    /// `volume_origin` is volume -> world, `pose` camera -> world. Both rigid.
    pub fn new(intrinsics: &'a PinholeIntrinsics, volume_origin: &Mat4, pose: &Mat4) -> Self {
        let camera_to_volume = volume_origin.inverse() * *pose;
        Self {
            intrinsics,
            camera_to_volume,
            volume_to_camera: camera_to_volume.inverse(),
        }
    }

    /// Camera center in the volume frame
    pub fn center(&self) -> Vec3 {
        self.camera_to_volume.w_axis.truncate()
    }
}
