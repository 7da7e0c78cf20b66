//! Core engine types and utilities

pub mod types;
pub mod error;
pub mod logging;
pub mod camera;
pub mod config;

pub use types::*;
pub use error::Error;
pub use camera::PinholeIntrinsics;
pub use config::{VolumeConfig, WeightModel};
