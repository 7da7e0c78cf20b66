//! Depth, color and RGB-D frames
//!
//! Depth is stored in meters, row-major, one `f32` per pixel. A reading of
//! `0.0` marks an invalid pixel (no return, or outside the sensor range).

use crate::core::camera::PinholeIntrinsics;
use crate::core::error::Error;
use crate::core::types::Result;

/// Row-major depth image in meters
#[derive(Clone, Debug, PartialEq)]
pub struct DepthFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl DepthFrame {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(Error::InvalidFrame(format!(
                "depth buffer holds {} pixels, {}x{} needs {}",
                data.len(),
                width,
                height,
                expected
            )));
        }
        Ok(Self { width, height, data })
    }

    /// Frame with every pixel invalid
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width as usize * height as usize],
        }
    }

    /// Depth at pixel `(u, v)`; `0.0` when invalid
    #[inline]
    pub fn get(&self, u: u32, v: u32) -> f32 {
        self.data[v as usize * self.width as usize + u as usize]
    }

    #[inline]
    pub fn set(&mut self, u: u32, v: u32, depth: f32) {
        let w = self.width as usize;
        self.data[v as usize * w + u as usize] = depth;
    }

    /// Number of pixels with a positive reading
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|&&d| d > 0.0).count()
    }

    /// Smallest and largest positive reading
    pub fn depth_range(&self) -> Option<(f32, f32)> {
        self.data
            .iter()
            .copied()
            .filter(|&d| d > 0.0)
            .fold(None, |acc, d| match acc {
                None => Some((d, d)),
                Some((lo, hi)) => Some((lo.min(d), hi.max(d))),
            })
    }
}

/// Row-major 8-bit RGB image
#[derive(Clone, Debug, PartialEq)]
pub struct ColorFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<[u8; 3]>,
}

impl ColorFrame {
    pub fn new(width: u32, height: u32, data: Vec<[u8; 3]>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(Error::InvalidFrame(format!(
                "color buffer holds {} pixels, {}x{} needs {}",
                data.len(),
                width,
                height,
                expected
            )));
        }
        Ok(Self { width, height, data })
    }

    /// Frame filled with one color
    pub fn uniform(width: u32, height: u32, color: [u8; 3]) -> Self {
        Self {
            width,
            height,
            data: vec![color; width as usize * height as usize],
        }
    }

    #[inline]
    pub fn get(&self, u: u32, v: u32) -> [u8; 3] {
        self.data[v as usize * self.width as usize + u as usize]
    }
}

/// Depth frame with an optional registered color frame
#[derive(Clone, Debug, PartialEq)]
pub struct RgbdFrame {
    pub depth: DepthFrame,
    pub color: Option<ColorFrame>,
}

impl RgbdFrame {
    pub fn new(depth: DepthFrame, color: Option<ColorFrame>) -> Result<Self> {
        if let Some(color) = &color {
            if color.width != depth.width || color.height != depth.height {
                return Err(Error::InvalidFrame(format!(
                    "color {}x{} does not match depth {}x{}",
                    color.width, color.height, depth.width, depth.height
                )));
            }
        }
        Ok(Self { depth, color })
    }

    /// Depth-only frame
    pub fn depth_only(depth: DepthFrame) -> Self {
        Self { depth, color: None }
    }

    /// Build a frame from raw sensor depth units.
    ///
    /// Each reading is divided by `depth_scale` (1000 for millimeters);
    /// readings that land outside `[near, far]` become invalid.
    pub fn from_raw_depth(
        raw: &[u16],
        color: Option<ColorFrame>,
        width: u32,
        height: u32,
        depth_scale: f32,
        near: f32,
        far: f32,
    ) -> Result<Self> {
        if !(depth_scale.is_finite() && depth_scale > 0.0) {
            return Err(Error::InvalidFrame(format!("depth scale {} must be positive", depth_scale)));
        }
        let data = raw
            .iter()
            .map(|&r| {
                let d = r as f32 / depth_scale;
                if d >= near && d <= far { d } else { 0.0 }
            })
            .collect();
        Self::new(DepthFrame::new(width, height, data)?, color)
    }

    pub fn width(&self) -> u32 {
        self.depth.width
    }

    pub fn height(&self) -> u32 {
        self.depth.height
    }

    /// Check the frame against the camera it claims to come from.
    ///
    /// Rejects mismatched dimensions and non-finite or negative depth.
    pub fn validate(&self, intrinsics: &PinholeIntrinsics) -> Result<()> {
        if !intrinsics.validate() {
            return Err(Error::InvalidFrame(format!("bad intrinsics {:?}", intrinsics)));
        }
        if self.depth.width != intrinsics.width || self.depth.height != intrinsics.height {
            return Err(Error::InvalidFrame(format!(
                "frame is {}x{}, camera is {}x{}",
                self.depth.width, self.depth.height, intrinsics.width, intrinsics.height
            )));
        }
        if self.depth.data.len() != intrinsics.pixel_count() {
            return Err(Error::InvalidFrame("depth buffer size does not match dimensions".to_string()));
        }
        if let Some(bad) = self.depth.data.iter().position(|d| !d.is_finite() || *d < 0.0) {
            return Err(Error::InvalidFrame(format!(
                "depth {} at pixel {} is not a finite non-negative distance",
                self.depth.data[bad], bad
            )));
        }
        if let Some(color) = &self.color {
            if color.data.len() != self.depth.data.len() {
                return Err(Error::InvalidFrame("color buffer size does not match depth".to_string()));
            }
        }
        Ok(())
    }
}
