//! Error type shared across the kiln workspace.

use crate::DType;
use thiserror::Error;

/// Errors raised while recognizing, partitioning, loading or assembling a model.
#[derive(Debug, Error)]
pub enum KilnError {
    /// No architecture fingerprint matched the weight blob.
    #[error("failed to recognize model architecture: {reason}")]
    Recognition {
        reason: String,
        #[source]
        source: Option<Box<KilnError>>,
    },

    /// A component's weights did not line up with what the component expects.
    #[error(
        "{component}: state dict mismatch (missing: {missing:?}, unexpected: {unexpected:?})"
    )]
    LoadKeyMismatch { component: String, missing: Vec<String>, unexpected: Vec<String> },

    /// A component whose (library, class) pair no loading rule handles.
    #[error("skipped component {component} = {library}.{class}")]
    ComponentSkipped { component: String, library: String, class: String },

    /// No registered engine accepts the recognized architecture.
    #[error("cannot assemble engine for {architecture}: {reason}")]
    Assembly { architecture: String, reason: String },

    /// An explicit storage override contradicts a pre-quantized checkpoint.
    #[error(
        "{component}: storage override {requested} conflicts with pre-quantized checkpoint dtype {on_disk}"
    )]
    ConflictingStorageOverride { component: String, requested: DType, on_disk: DType },

    #[error("quantization error: {0}")]
    Quantization(String),

    #[error("tensor error: {0}")]
    Tensor(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("architecture repository error: {0}")]
    Repository(String),

    #[error("safetensors error: {0}")]
    Safetensors(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KilnError {
    /// Wrap an underlying failure as a recognition failure, keeping the cause.
    pub fn recognition(reason: impl Into<String>, cause: KilnError) -> Self {
        Self::Recognition { reason: reason.into(), source: Some(Box::new(cause)) }
    }

    /// Recognition failure with no underlying cause.
    pub fn unrecognized(reason: impl Into<String>) -> Self {
        Self::Recognition { reason: reason.into(), source: None }
    }

    pub fn is_recognition(&self) -> bool {
        matches!(self, Self::Recognition { .. })
    }

    /// Component name carried by the error, if any.
    pub fn component(&self) -> Option<&str> {
        match self {
            Self::LoadKeyMismatch { component, .. }
            | Self::ComponentSkipped { component, .. }
            | Self::ConflictingStorageOverride { component, .. } => Some(component),
            _ => None,
        }
    }
}

/// Workspace-wide result alias.
pub type Result<T> = std::result::Result<T, KilnError>;
