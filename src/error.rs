//! Error types for the cache

use thiserror::Error;

/// Main error type for the cache
#[derive(Error, Debug)]
pub enum Error {
    /// A request carried a value or argument of the wrong shape
    ///
    /// Never retried; surfaced to the caller verbatim.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The backend store could not be reached or rejected a command
    #[error("Backend unavailable: {0}")]
    Backend(String),

    /// Stored values or dump records could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The registry holds no collection with this name
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short label used for metrics and log fields
    pub fn kind_label(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Backend(_) => "backend",
            Error::Serialization(_) => "serialization",
            Error::Configuration(_) => "configuration",
            Error::CollectionNotFound(_) => "not_found",
            Error::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
