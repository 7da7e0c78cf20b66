//! Error types for the fusion engine

use thiserror::Error;

use crate::voxel::block::BlockKey;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    /// Hash directory full: bucket chain at its depth limit or no overflow
    /// nodes left.
    #[error("hash directory capacity exceeded inserting {key:?}: {reason}")]
    CapacityExceeded { key: BlockKey, reason: String },

    /// Voxel block pool has no free slot, or the requested pool does not
    /// fit in memory.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Frame rejected before any stage ran.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Marching-cubes cell that cannot be triangulated.
    #[error("degenerate geometry in cell at voxel {0:?}")]
    DegenerateGeometry(glam::IVec3),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error only drops the current frame's contribution.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::CapacityExceeded { .. } | Error::OutOfMemory(_))
    }
}
