//! Error types for repository operations.

use thiserror::Error;

/// Repository error type.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// The target index is empty or whitespace.
    #[error("index is missing or malformed")]
    MalformedIndex,

    /// Document content is missing or not valid JSON.
    #[error("document content is missing or malformed")]
    MalformedDocumentContent,

    /// The repository or bulk indexer has been closed.
    #[error("repository already closed")]
    Closed,

    /// Invalid argument supplied by the caller.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// The backend rejected the request as a bad request.
    #[error("{operation}: {message}")]
    Query {
        /// Operation that was rejected.
        operation: String,
        /// Backend message.
        message: String,
    },

    /// Backend or availability failure.
    #[error("OpenSearch error: {0}")]
    Backend(String),

    /// A backend response body could not be decoded.
    #[error("could not decode {context}: {source}")]
    Decode {
        /// What was being decoded.
        context: &'static str,
        /// Underlying parser error.
        #[source]
        source: serde_json::Error,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Batch-level bulk failure reported against each item of the batch.
    #[error("bulk request failed: {0}")]
    Bulk(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The cluster never became available during start-up polling.
    #[error("maximum number of retries ({retries}) exceeded for retrieving cluster info")]
    ClusterUnavailable {
        /// Attempts made before giving up.
        retries: u32,
    },

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Client error from opensearch crate.
    #[error("Client error: {0}")]
    Client(#[from] opensearch::Error),
}

impl RepositoryError {
    /// Whether the error was caused by a malformed query the caller can fix.
    pub fn is_query_error(&self) -> bool {
        matches!(self, RepositoryError::Query { .. })
    }

    pub(crate) fn decode(context: &'static str, source: serde_json::Error) -> Self {
        RepositoryError::Decode { context, source }
    }
}

/// Result type alias for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;
