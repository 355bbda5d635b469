use std::path::{Path, PathBuf};

use crate::types::VdfsError;
use thiserror::Error;

/// Error type for administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Volume image not found at the specified path.
    #[error("volume image not found: {0}")]
    MissingImage(PathBuf),
    /// Engine error.
    #[error(transparent)]
    Core(#[from] VdfsError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_image(path: impl AsRef<Path>) -> Self {
        AdminError::MissingImage(path.as_ref().to_path_buf())
    }
}
