//! Error types for chartfuse-data

use thiserror::Error;

/// Errors raised by tables, query plans, and connections.
#[derive(Error, Debug)]
pub enum DataError {
    /// The backend cannot perform the requested operation
    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    /// A referenced table is not registered with the connection
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// A query result did not have the schema the caller expected
    #[error("Schema mismatch: expected [{expected}], got [{actual}]")]
    SchemaMismatch { expected: String, actual: String },

    /// Input data could not be interpreted as a table
    #[error("Invalid table data: {0}")]
    InvalidData(String),

    /// The backend failed while executing a query
    #[error("Query failed: {0}")]
    Query(String),

    /// The connection can no longer accept requests
    #[error("Connection unavailable: {0}")]
    Unavailable(String),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DataError {
    pub fn not_supported(operation: impl Into<String>) -> Self {
        DataError::OperationNotSupported(operation.into())
    }

    /// True when the error signals a missing backend capability rather than a failure.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, DataError::OperationNotSupported(_))
    }

    /// Produce an owned copy of this error.
    ///
    /// Wrapped foreign errors are not `Clone`; their copies keep the message
    /// and become [`DataError::Query`].
    pub fn duplicate(&self) -> Self {
        match self {
            DataError::OperationNotSupported(s) => DataError::OperationNotSupported(s.clone()),
            DataError::TableNotFound(s) => DataError::TableNotFound(s.clone()),
            DataError::SchemaMismatch { expected, actual } => DataError::SchemaMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            DataError::InvalidData(s) => DataError::InvalidData(s.clone()),
            DataError::Query(s) => DataError::Query(s.clone()),
            DataError::Unavailable(s) => DataError::Unavailable(s.clone()),
            other => DataError::Query(other.to_string()),
        }
    }
}

/// Result type for data-layer operations
pub type DataResult<T> = std::result::Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_supported_is_detected() {
        assert!(DataError::not_supported("register_parquet").is_not_supported());
        assert!(!DataError::TableNotFound("t".into()).is_not_supported());
    }

    #[test]
    fn duplicate_preserves_variant_and_message() {
        let err = DataError::SchemaMismatch {
            expected: "a: integer".into(),
            actual: "a: utf8".into(),
        };
        let copy = err.duplicate();
        assert!(matches!(copy, DataError::SchemaMismatch { .. }));
        assert_eq!(copy.to_string(), err.to_string());

        let io = DataError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        let copy = io.duplicate();
        assert!(matches!(copy, DataError::Query(_)));
        assert!(copy.to_string().contains("disk"));
    }
}
