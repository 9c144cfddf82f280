//! Error kinds surfaced by the review/curation core.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = CurationError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum CurationError {
    #[error("unknown species label: {0:?}")]
    UnknownLabel(String),

    #[error("malformed detection: {0}")]
    MalformedDetection(String),

    #[error("could not open video {path}: {reason}")]
    VideoOpenError { path: PathBuf, reason: String },

    #[error("frame index {index} out of range (video has {frame_count} frames)")]
    FrameIndexOutOfRange { index: i64, frame_count: usize },

    #[error("failed to decode frame {index}: {reason}")]
    DecodeError { index: usize, reason: String },

    #[error("could not persist curated frame: {0}")]
    PersistenceError(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not list {path}: {reason}")]
    ListingError { path: PathBuf, reason: String },

    #[error("no {level} named {name:?}")]
    UnknownEntry { level: &'static str, name: String },
}

impl CurationError {
    pub(crate) fn video_open(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::VideoOpenError {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn decode(index: usize, reason: impl ToString) -> Self {
        Self::DecodeError {
            index,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn persistence(context: &str, err: impl std::fmt::Display) -> Self {
        Self::PersistenceError(format!("{context}: {err}"))
    }

    pub(crate) fn listing(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ListingError {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Open and decode failures are shown to the operator; everything else
    /// points at misuse by the caller.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::VideoOpenError { .. }
                | Self::DecodeError { .. }
                | Self::PersistenceError(_)
                | Self::ListingError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_message_names_bounds() {
        let err = CurationError::FrameIndexOutOfRange {
            index: -1,
            frame_count: 12,
        };
        assert_eq!(
            err.to_string(),
            "frame index -1 out of range (video has 12 frames)"
        );
        assert!(!err.is_user_visible());
    }

    #[test]
    fn open_failures_are_user_visible() {
        let err = CurationError::video_open("species/x.avi", "no such file");
        assert!(err.is_user_visible());
        assert!(err.to_string().contains("species/x.avi"));
    }
}
