//! TSDF voxel

use bytemuck::{Pod, Zeroable};

/// Single TSDF voxel - exactly 12 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Voxel {
    /// Signed distance normalized by the truncation distance, in [-1, 1].
    /// Positive in front of the surface.
    pub tsdf: f32,
    /// Accumulated observation weight
    pub weight: f32,
    /// Weighted-average RGB color
    pub color: [u8; 3],
    _pad: u8,
}

impl Voxel {
    /// Unobserved voxel
    pub const EMPTY: Voxel = Voxel {
        tsdf: 1.0,
        weight: 0.0,
        color: [0; 3],
        _pad: 0,
    };

    pub fn new(tsdf: f32, weight: f32, color: [u8; 3]) -> Self {
        Self { tsdf, weight, color, _pad: 0 }
    }

    /// Whether any observation has been fused into this voxel
    pub fn is_observed(&self) -> bool {
        self.weight > 0.0
    }

    /// Fuse one observation with a weighted running average.
    ///
    /// `weight' = weight + w_obs`, `tsdf' = (tsdf * weight + tsdf_obs * w_obs) / weight'`.
    /// Color is averaged with the same weights. A zero-weight observation
    /// leaves the voxel untouched. The whole voxel is written in one store.
    #[inline]
    pub fn fuse(&mut self, tsdf_obs: f32, w_obs: f32, color_obs: Option<[u8; 3]>) {
        if w_obs <= 0.0 {
            return;
        }
        let weight = self.weight + w_obs;
        let tsdf = (self.tsdf * self.weight + tsdf_obs * w_obs) / weight;
        let color = match color_obs {
            Some(obs) => {
                let mut out = [0u8; 3];
                for i in 0..3 {
                    let c = (self.color[i] as f32 * self.weight + obs[i] as f32 * w_obs) / weight;
                    out[i] = c.round().clamp(0.0, 255.0) as u8;
                }
                out
            }
            None => self.color,
        };
        *self = Voxel::new(tsdf, weight, color);
    }
}

impl Default for Voxel {
    fn default() -> Self {
        Self::EMPTY
    }
}
