//! Error types shared across the Sparkie workspace.

use thiserror::Error;

/// Top-level error for the scheduling engine and its HTTP surface.
#[derive(Debug, Error)]
pub enum SparkieError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("API key missing for provider: {0}")]
    ApiKeyMissing(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SparkieError {
    /// Whether the error was caused by the caller rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_) | Self::NotFound(_) | Self::Conflict(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SparkieError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_detail() {
        let err = SparkieError::NotFound("task t-1".into());
        assert_eq!(err.to_string(), "Not found: task t-1");
    }

    #[test]
    fn test_client_error_classification() {
        assert!(SparkieError::InvalidInput("bad".into()).is_client_error());
        assert!(SparkieError::Conflict("busy".into()).is_client_error());
        assert!(!SparkieError::Database("locked".into()).is_client_error());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: SparkieError = io.into();
        assert!(matches!(err, SparkieError::Io(_)));
    }
}
