use std::path::PathBuf;

use thiserror::Error;

use crate::job::JobState;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Input directory {path} is not usable: {reason}")]
    InputDirectory { path: PathBuf, reason: String },

    #[error("Failed to create output directory {path}: {source}")]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoder not found: {path}")]
    EncoderNotFound { path: PathBuf },

    #[error("Encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error("Invalid job transition from {from:?} to {to:?}")]
    InvalidTransition { from: JobState, to: JobState },
}

impl ConvertError {
    /// Whether this error must stop the run before any job starts.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::InputDirectory { .. }
                | Self::OutputDirectory { .. }
                | Self::EncoderNotFound { .. }
                | Self::EncoderUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConvertError>;
