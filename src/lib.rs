//! Rkfusion - sparse voxel-hashed TSDF fusion
//!
//! Fuses posed depth (and color) frames into a spatially hashed
//! truncated signed distance field, then ray-casts or meshes it.

pub mod core;
pub mod math;
pub mod frame;
pub mod voxel;
pub mod fusion;
pub mod synthetic;

pub use crate::core::{Error, PinholeIntrinsics, Result, VolumeConfig, WeightModel};
pub use crate::frame::{ColorFrame, DepthFrame, RgbdFrame};
pub use crate::fusion::{FrameStats, Mesh, RayCastImage, TsdfVolume, VolumeStats};
