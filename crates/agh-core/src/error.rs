use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AghError>;

#[derive(Debug, Error)]
pub enum AghError {
    /// An entity file or required input could not be found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A persisted record did not match its descriptor.
    #[error("malformed {record} record: {reason}")]
    MalformedRecord { record: &'static str, reason: String },

    /// A constructor invariant was violated.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A destination already exists and the strict policy was requested.
    #[error("conflict: {} already exists", .0.display())]
    Conflict(PathBuf),

    /// An external build/test/render command finished unsuccessfully.
    #[error("external tool `{command}` exited with {code:?}: {stderr}")]
    ExternalTool {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Walk(#[from] walkdir::Error),
}

impl AghError {
    pub fn malformed(record: &'static str, reason: impl Into<String>) -> Self {
        AghError::MalformedRecord {
            record,
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            AghError::NotFound(_) => true,
            AghError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
