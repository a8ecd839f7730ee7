use std::path::PathBuf;
use thiserror::Error;

/// Structured error types for the SAM inference pipeline.
///
/// # Why one variant per failure kind
///
/// Callers decide policy (retry with another image, abort at startup, alert) from the
/// variant alone, so the core never folds one kind into another. A bad image stays
/// `InvalidImage` all the way up to the caller of `Sam::predict`.
#[derive(Error, Debug)]
pub enum SamError {
    #[error("Invalid image: {reason}")]
    InvalidImage { reason: String },

    #[error("Model load error: {reason} ({path:?})")]
    ModelLoad {
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid state: {operation} {reason}")]
    InvalidState { operation: String, reason: String },

    #[error("Malformed model output: {reason}")]
    MalformedOutput { reason: String },

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Inference error: {operation} failed")]
    Inference {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Codec error: {operation} failed")]
    Codec {
        operation: String,
        #[source]
        source: image::ImageError,
    },
}

pub type Result<T> = std::result::Result<T, SamError>;

impl SamError {
    pub(crate) fn model_load(
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
        source: Option<ort::Error>,
    ) -> Self {
        Self::ModelLoad {
            path: path.into(),
            reason: reason.into(),
            source: source.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        }
    }

    pub(crate) fn inference(operation: impl Into<String>, source: ort::Error) -> Self {
        Self::Inference {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedOutput {
            reason: reason.into(),
        }
    }

    pub(crate) fn released(operation: &str) -> Self {
        Self::InvalidState {
            operation: operation.to_string(),
            reason: "on a released tensor".to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// # Why default values for context
///
/// Some I/O errors occur without specific path/operation context. Rather than
/// requiring all callsites to wrap errors manually, this conversion provides
/// a fallback. Code that has context should construct SamError::FileSystem
/// directly with the specific path and operation.
impl From<std::io::Error> for SamError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Convert image crate errors to codec errors.
impl From<image::ImageError> for SamError {
    fn from(err: image::ImageError) -> Self {
        Self::Codec {
            operation: "image codec".to_string(),
            source: err,
        }
    }
}
