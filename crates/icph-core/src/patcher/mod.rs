//! The metadata-patch capability: rewrite a file's embedded capture time.

pub mod exiftool;

use std::path::Path;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use thiserror::Error;

use crate::media::MediaKind;

pub use exiftool::ExifTool;

/// Failure reported by a patcher. `message` carries the tool's own text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PatchError {
    pub transient: bool,
    pub message: String,
}

impl PatchError {
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }
}

/// Writes capture timestamps into media files.
pub trait MetadataPatcher: Send + Sync {
    /// Rewrite the capture-time fields of `path` in place.
    fn patch(
        &self,
        path: &Path,
        kind: MediaKind,
        captured: DateTime<FixedOffset>,
    ) -> Result<(), PatchError>;

    /// Read back the embedded capture time as a wall-clock value.
    /// `Ok(None)` means the patcher cannot read this kind of file.
    fn read_capture_time(
        &self,
        path: &Path,
        kind: MediaKind,
    ) -> Result<Option<NaiveDateTime>, PatchError> {
        match kind {
            MediaKind::Image => crate::exif::read_capture_time(path)
                .map_err(|e| PatchError::terminal(format!("reading EXIF: {}", e))),
            _ => Ok(None),
        }
    }
}
