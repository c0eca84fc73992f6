use std::path::PathBuf;

use crate::section::SectionPos;

/// Result type for LOD storage operations
pub type LodResult<T> = Result<T, LodError>;

/// Errors that can occur across the LOD storage core
#[derive(Debug, thiserror::Error)]
pub enum LodError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted file {path}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("checksum mismatch in {path}: header {expected:#010x}, payload {actual:#010x}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    #[error("no loader registered for datatype {datatype:#018x} version {version}")]
    NoLoader { datatype: u64, version: u8 },

    #[error("loader for datatype {datatype:#018x} versions {first}..={last} overlaps an existing registration")]
    LoaderConflict { datatype: u64, first: u8, last: u8 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("thread pool error: {0}")]
    ThreadPool(String),

    #[error("generation failed for section {0}")]
    GenerationFailed(SectionPos),

    /// Cooperative shutdown reached an in-flight operation. Distinguished
    /// from real failures so callers cancel cleanly instead of logging an
    /// error (see the flush path).
    #[error("interrupted during shutdown")]
    Interrupted,
}

impl From<bincode::Error> for LodError {
    fn from(err: bincode::Error) -> Self {
        LodError::Serialization(err.to_string())
    }
}

impl LodError {
    /// Whether this failure is a cancellation rather than an error.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, LodError::Interrupted)
    }
}
