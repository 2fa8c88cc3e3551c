//! Error types for chartfuse-core

use chartfuse_data::DataError;
use thiserror::Error;

/// Fatal errors. Non-fatal conditions are reported as [`crate::Warning`]s.
#[derive(Error, Debug)]
pub enum ChartError {
    /// Cyclic or unresolved reference, or a malformed spec document
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    /// A transform could not be evaluated and the connection forbids fallback
    #[error("Unsupported transform '{transform}' in dataset '{dataset}'")]
    UnsupportedTransform { dataset: String, transform: String },

    /// Query failure or schema mismatch reported by the connection
    #[error("Connection error: {0}")]
    Connection(#[from] DataError),

    #[error("Expression error: {0}")]
    Expression(String),

    /// The caller asked for something the spec or session cannot provide
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("'{0}' is not supported over this transport")]
    NotSupportedOverTransport(String),

    #[error("Chart state is closed")]
    Closed,

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChartError {
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        ChartError::InvalidSpec(msg.into())
    }

    pub fn expression(msg: impl Into<String>) -> Self {
        ChartError::Expression(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ChartError::Internal(msg.into())
    }

    /// Owned copy handed to every waiter of a shared computation.
    pub fn duplicate(&self) -> Self {
        match self {
            ChartError::InvalidSpec(s) => ChartError::InvalidSpec(s.clone()),
            ChartError::UnsupportedTransform { dataset, transform } => {
                ChartError::UnsupportedTransform {
                    dataset: dataset.clone(),
                    transform: transform.clone(),
                }
            }
            ChartError::Connection(e) => ChartError::Connection(e.duplicate()),
            ChartError::Expression(s) => ChartError::Expression(s.clone()),
            ChartError::InvalidRequest(s) => ChartError::InvalidRequest(s.clone()),
            ChartError::NotSupportedOverTransport(s) => {
                ChartError::NotSupportedOverTransport(s.clone())
            }
            ChartError::Closed => ChartError::Closed,
            ChartError::Serialization(e) => ChartError::Internal(e.to_string()),
            ChartError::Internal(s) => ChartError::Internal(s.clone()),
        }
    }
}

/// Result type for chartfuse-core operations
pub type Result<T> = std::result::Result<T, ChartError>;
