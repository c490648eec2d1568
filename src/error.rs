//! Error taxonomy for the ensemble engine.
//!
//! Every failure that leaves the library is one of these variants. Numeric
//! runtime internals (ONNX Runtime messages, shape dumps) are logged where they
//! happen and never copied verbatim into a variant's message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, EnsembleError>;

/// Errors surfaced by the ensemble engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnsembleError {
    /// A backbone could not be loaded; the backbone is unavailable, the process continues
    #[error("failed to load backbone '{backbone}': {reason}")]
    ModelLoad { backbone: String, reason: String },

    /// Unknown backbone, or a backbone that failed to load
    #[error("backbone not found or unavailable: {0}")]
    NotFound(String),

    /// Client supplied bytes that do not decode to a usable raster image
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// Numeric failure inside a single backbone call
    #[error("inference failed in backbone '{backbone}': {reason}")]
    Inference { backbone: String, reason: String },

    /// Every backbone was unavailable or failed for this request
    #[error("no valid predictions: {0}")]
    NoValidPredictions(String),

    /// The request exceeded its wall-clock budget
    #[error("processing timeout after {budget_ms} ms")]
    ProcessingTimeout { budget_ms: u64 },

    /// Invalid configuration supplied at startup
    #[error("configuration error: {0}")]
    Config(String),
}

/// Stable, serializable error code for the API layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ModelLoad,
    NotFound,
    InvalidImage,
    Inference,
    NoValidPredictions,
    ProcessingTimeout,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ModelLoad => "model_load",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidImage => "invalid_image",
            ErrorKind::Inference => "inference",
            ErrorKind::NoValidPredictions => "no_valid_predictions",
            ErrorKind::ProcessingTimeout => "processing_timeout",
            ErrorKind::Config => "config",
        }
    }
}

impl EnsembleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EnsembleError::ModelLoad { .. } => ErrorKind::ModelLoad,
            EnsembleError::NotFound(_) => ErrorKind::NotFound,
            EnsembleError::InvalidImage(_) => ErrorKind::InvalidImage,
            EnsembleError::Inference { .. } => ErrorKind::Inference,
            EnsembleError::NoValidPredictions(_) => ErrorKind::NoValidPredictions,
            EnsembleError::ProcessingTimeout { .. } => ErrorKind::ProcessingTimeout,
            EnsembleError::Config(_) => ErrorKind::Config,
        }
    }

    /// Only timeouts are worth retrying; the core itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EnsembleError::ProcessingTimeout { .. })
    }

    /// Errors caused by the caller's input rather than by the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EnsembleError::InvalidImage(_) | EnsembleError::NotFound(_)
        )
    }

    pub(crate) fn inference(backbone: &str, reason: impl Into<String>) -> Self {
        EnsembleError::Inference {
            backbone: backbone.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn model_load(backbone: &str, reason: impl Into<String>) -> Self {
        EnsembleError::ModelLoad {
            backbone: backbone.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let timeout = EnsembleError::ProcessingTimeout { budget_ms: 100 };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_client_error());

        let invalid = EnsembleError::InvalidImage("empty".to_string());
        assert!(invalid.is_client_error());
        assert!(!invalid.is_retryable());

        let failed = EnsembleError::NoValidPredictions("all backbones failed".to_string());
        assert!(!failed.is_client_error());
        assert_eq!(failed.kind(), ErrorKind::NoValidPredictions);
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::ProcessingTimeout).unwrap();
        assert_eq!(json, "\"processing_timeout\"");
        assert_eq!(ErrorKind::InvalidImage.as_str(), "invalid_image");
    }

    #[test]
    fn test_error_display() {
        let err = EnsembleError::inference("resnet50", "non-finite logits");
        assert_eq!(
            err.to_string(),
            "inference failed in backbone 'resnet50': non-finite logits"
        );
    }
}
