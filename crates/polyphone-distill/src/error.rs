use std::path::PathBuf;

use polyphone_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DistillError {
    #[error("Data file not found: {}", .0.display())]
    DataNotFound(PathBuf),

    #[error("Malformed data in {}: {reason}", .path.display())]
    DataFormat { path: PathBuf, reason: String },

    /// Recovered locally by the encoder; never returned from `encode`.
    #[error("Example {guid}: annotation at position {position} ({label}) does not match the text: {reason}")]
    LabelAlignment {
        guid: String,
        position: i64,
        label: String,
        reason: String,
    },

    #[error("Example {guid}: label position {label_pos} is outside max_seq_length {max_seq_length}")]
    Encoding {
        guid: String,
        label_pos: i64,
        max_seq_length: usize,
    },

    #[error("Cannot resume from {}: {reason}", .dir.display())]
    Resume { dir: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type DistillResult<T> = Result<T, DistillError>;
