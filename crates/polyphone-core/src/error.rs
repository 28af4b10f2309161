use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Hugging Face Hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("Model config error: {field}: {reason}")]
    Config { field: String, reason: String },

    #[error("Missing model file: {0}")]
    MissingFile(String),

    #[error("State dict mismatch: {0}")]
    StateMismatch(String),

    #[error("Device not available: {0}")]
    DeviceUnavailable(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
