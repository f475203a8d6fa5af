//! # Error taxonomy
//!
//! Every fallible operation in the retrieval subsystem returns [`RagError`].
//! Variants map one-to-one onto the failure classes callers must be able to
//! tell apart:
//!
//! - [`RagError::DimensionMismatch`] / [`RagError::LengthMismatch`]: caller errors on
//!   [`VectorIndex::add`](crate::vector_store::VectorIndex::add); the index is left unchanged.
//! - [`RagError::Gateway`]: the embedding or completion service was unreachable,
//!   timed out, or answered with something unusable.
//! - [`RagError::Cancelled`]: the caller cancelled an in-flight query.
//! - [`RagError::Io`] / [`RagError::Deserialization`]: persistence failures.
//! - [`RagError::EmptyQuery`]: rejected before any gateway is contacted.
//! - [`RagError::Index`] / [`RagError::Config`]: the index or the configuration cannot be used.
//!
//! An empty retrieval result is **not** an error.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by indexing, persistence, gateways and the query protocol.
#[derive(Debug, Error)]
pub enum RagError {
    /// An embedding does not have the index's established dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension the index (or first vector of the batch) established.
        expected: usize,
        /// Dimension of the offending vector.
        actual: usize,
    },

    /// `add` was called with a different number of chunks and vectors.
    #[error("chunk/vector count mismatch: {chunks} chunks, {vectors} vectors")]
    LengthMismatch { chunks: usize, vectors: usize },

    /// The embedding or completion service failed.
    #[error("{service} gateway error: {message}")]
    Gateway {
        /// `"embedding"` or `"completion"`.
        service: &'static str,
        message: String,
    },

    /// The query was cancelled before it completed.
    #[error("query cancelled")]
    Cancelled,

    /// The query text was empty or whitespace-only.
    #[error("query is empty")]
    EmptyQuery,

    /// Reading or writing a persisted artifact failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted artifact could not be decoded, or the artifact pair is inconsistent.
    #[error("failed to decode {artifact}: {message}")]
    Deserialization { artifact: String, message: String },

    /// The index could not be built or encoded.
    #[error("vector index error: {0}")]
    Index(String),

    /// Configuration or template values are invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RagError {
    /// Shorthand for a [`RagError::Gateway`] error.
    pub fn gateway(service: &'static str, message: impl Into<String>) -> Self {
        Self::Gateway {
            service,
            message: message.into(),
        }
    }

    /// Attach a path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn deserialization(artifact: impl Into<String>, message: impl ToString) -> Self {
        Self::Deserialization {
            artifact: artifact.into(),
            message: message.to_string(),
        }
    }
}

/// Convenience result alias used across the crate.
pub type Result<T> = std::result::Result<T, RagError>;
