//! Volume configuration.
//!
//! Capacities are fixed at construction: growing the directory or the pool
//! means building a new volume.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;

/// How much confidence a single depth observation contributes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WeightModel {
    /// Every observation counts the same.
    Constant { weight: f32 },
    /// Structured-light noise grows with depth squared; the weight is
    /// `(min_depth / depth)^2`, i.e. 1 at the near plane.
    DepthNoise,
}

impl WeightModel {
    /// Observation weight for a reading at `depth`.
    pub fn weight(&self, depth: f32, min_depth: f32) -> f32 {
        match *self {
            WeightModel::Constant { weight } => weight,
            WeightModel::DepthNoise => {
                let ratio = min_depth / depth.max(min_depth);
                ratio * ratio
            }
        }
    }
}

impl Default for WeightModel {
    fn default() -> Self {
        WeightModel::Constant { weight: 1.0 }
    }
}

/// Configuration for a [`TsdfVolume`](crate::fusion::TsdfVolume).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Number of hash buckets.
    pub bucket_count: usize,
    /// Inline entries per bucket.
    pub bucket_size: usize,
    /// Max overflow nodes chained behind one bucket.
    pub max_chain_len: usize,
    /// Overflow nodes shared by all buckets.
    pub overflow_capacity: usize,
    /// Voxel blocks preallocated in the pool.
    pub max_blocks: usize,
    /// Voxel edge length in meters.
    pub voxel_size: f32,
    /// Truncation distance μ in meters (typically 3-5 voxels).
    pub sdf_trunc: f32,
    /// Depth readings below this are invalid (meters).
    pub min_depth: f32,
    /// Depth readings above this are invalid (meters).
    pub max_depth: f32,
    /// Observation weighting.
    pub weight_model: WeightModel,
    /// Fuse color when the frame carries it.
    pub integrate_color: bool,
    /// Ray-marching step in voxels.
    pub raycast_step_factor: f32,
    /// Isosurface level for meshing, in normalized TSDF units.
    pub iso_level: f32,
    /// Corners with weight at or below this are treated as unobserved.
    pub min_mesh_weight: f32,
    /// Upper bound on bytes the pool and directory may take.
    pub memory_budget_bytes: u64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            bucket_count: 10_000,
            bucket_size: 4,
            max_chain_len: 16,
            overflow_capacity: 40_000,
            max_blocks: 50_000,
            voxel_size: 0.01,
            sdf_trunc: 0.03,
            min_depth: 0.1,
            max_depth: 3.5,
            weight_model: WeightModel::default(),
            integrate_color: true,
            raycast_step_factor: 0.5,
            iso_level: 0.0,
            min_mesh_weight: 0.0,
            memory_budget_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

impl VolumeConfig {
    /// Config with the given voxel size and μ = 3 voxels.
    pub fn with_voxel_size(voxel_size: f32) -> Self {
        Self {
            voxel_size,
            sdf_trunc: 3.0 * voxel_size,
            ..Default::default()
        }
    }

    /// Set the pool capacity.
    pub fn max_blocks(mut self, max_blocks: usize) -> Self {
        self.max_blocks = max_blocks;
        self
    }

    /// Set the bucket count.
    pub fn bucket_count(mut self, bucket_count: usize) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    /// Set the valid depth range.
    pub fn depth_range(mut self, min_depth: f32, max_depth: f32) -> Self {
        self.min_depth = min_depth;
        self.max_depth = max_depth;
        self
    }

    /// Edge length of one block in meters.
    pub fn block_length(&self) -> f32 {
        self.voxel_size * crate::voxel::block::BLOCK_SIZE as f32
    }

    /// Total directory entries (inline plus overflow).
    pub fn directory_capacity(&self) -> usize {
        self.bucket_count * self.bucket_size + self.overflow_capacity
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 {
            return Err(Error::InvalidConfig("bucket_count must be greater than 0".to_string()));
        }
        if self.bucket_size == 0 {
            return Err(Error::InvalidConfig("bucket_size must be greater than 0".to_string()));
        }
        if self.bucket_count > u32::MAX as usize / self.bucket_size
            || self.overflow_capacity >= u32::MAX as usize
            || self.max_blocks >= u32::MAX as usize
        {
            return Err(Error::InvalidConfig("capacities must fit 32-bit indices".to_string()));
        }
        if !(self.voxel_size.is_finite() && self.voxel_size > 0.0) {
            return Err(Error::InvalidConfig(format!("voxel_size {} must be positive", self.voxel_size)));
        }
        if !(self.sdf_trunc.is_finite() && self.sdf_trunc > 0.0) {
            return Err(Error::InvalidConfig(format!("sdf_trunc {} must be positive", self.sdf_trunc)));
        }
        if !(self.min_depth >= 0.0 && self.max_depth > self.min_depth && self.max_depth.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "depth range [{}, {}] is empty",
                self.min_depth, self.max_depth
            )));
        }
        if !(self.raycast_step_factor.is_finite() && self.raycast_step_factor > 0.0) {
            return Err(Error::InvalidConfig("raycast_step_factor must be positive".to_string()));
        }
        if !(-1.0..1.0).contains(&self.iso_level) {
            return Err(Error::InvalidConfig(format!("iso_level {} outside (-1, 1)", self.iso_level)));
        }
        match self.weight_model {
            WeightModel::Constant { weight } if !(weight.is_finite() && weight >= 0.0) => {
                return Err(Error::InvalidConfig(format!("constant weight {} must be >= 0", weight)));
            }
            // Normalized to min_depth; a zero near plane weights every reading 0
            WeightModel::DepthNoise if self.min_depth <= 0.0 => {
                return Err(Error::InvalidConfig(
                    "depth_noise weights need min_depth > 0".to_string(),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: VolumeConfig = serde_json::from_str(&text)?;
        config.validate()?;
        log::info!("Loaded volume config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Write the config as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        VolumeConfig::default().validate().unwrap();
        assert!((VolumeConfig::default().block_length() - 0.08).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad = VolumeConfig { voxel_size: 0.0, ..Default::default() };
        assert!(matches!(bad.validate(), Err(Error::InvalidConfig(_))));

        let bad = VolumeConfig::default().depth_range(2.0, 1.0);
        assert!(bad.validate().is_err());

        let bad = VolumeConfig { bucket_count: 0, ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_zero_blocks_is_a_valid_config() {
        VolumeConfig::default().max_blocks(0).validate().unwrap();
    }

    #[test]
    fn test_weight_models() {
        let constant = WeightModel::Constant { weight: 2.0 };
        assert_eq!(constant.weight(3.0, 0.1), 2.0);

        let noise = WeightModel::DepthNoise;
        assert!((noise.weight(0.1, 0.1) - 1.0).abs() < 1e-6);
        assert!((noise.weight(0.2, 0.1) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_depth_noise_needs_positive_near_plane() {
        let config = VolumeConfig {
            weight_model: WeightModel::DepthNoise,
            ..VolumeConfig::default().depth_range(0.0, 3.0)
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        // Constant weights do not depend on the near plane
        VolumeConfig::default().depth_range(0.0, 3.0).validate().unwrap();
        VolumeConfig { weight_model: WeightModel::DepthNoise, ..Default::default() }
            .validate()
            .unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.json");

        let config = VolumeConfig {
            weight_model: WeightModel::DepthNoise,
            ..VolumeConfig::with_voxel_size(0.005).max_blocks(1234)
        };
        config.save(&path).unwrap();

        let loaded = VolumeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "voxel_size": 0.02, "sdf_trunc": 0.06 }"#).unwrap();

        let loaded = VolumeConfig::load(&path).unwrap();
        assert_eq!(loaded.voxel_size, 0.02);
        assert_eq!(loaded.max_blocks, VolumeConfig::default().max_blocks);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(VolumeConfig::load(&path), Err(Error::Config(_))));
        assert!(matches!(VolumeConfig::load(dir.path().join("missing.json")), Err(Error::Io(_))));
    }
}
