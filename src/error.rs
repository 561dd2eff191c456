//! Error types for the Nimbus metadata-coordination core.
//!
//! This module provides a unified error type [`MetaError`] for all
//! metadata-coordination operations, along with a convenient [`Result`]
//! type alias.
//!
//! # Error Categories
//!
//! - **Backend**: any non-OK response from the backing consensus store,
//!   carrying its numeric code and message.
//! - **Invalid**: programmer errors (e.g. double unlock). Returned
//!   synchronously and never retried.
//! - **PartialCommit**: a multi-chunk commit failed after earlier chunks
//!   were already applied; callers needing transactional boundaries must
//!   compensate or size their change sets below the chunk limit.
//! - **InvalidConfig**: invalid settings or missing configuration.

use thiserror::Error;

/// Main error type for metadata-coordination operations.
#[derive(Error, Debug)]
pub enum MetaError {
    /// Non-OK response from the backing consensus store.
    #[error("backing store error (code {code}): {message}")]
    Backend { code: i32, message: String },

    /// Programmer error; never retried.
    #[error("invalid: {0}")]
    Invalid(String),

    /// A non-final chunk of a batched commit failed after `applied`
    /// operations were already committed. Earlier chunks are not rolled
    /// back.
    #[error("partial commit: {applied} operations applied before failure (code {code}): {message}")]
    PartialCommit {
        applied: usize,
        code: i32,
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },
}

impl MetaError {
    /// Shorthand for a backing-store error.
    pub fn backend(code: i32, message: impl Into<String>) -> Self {
        MetaError::Backend {
            code,
            message: message.into(),
        }
    }

    /// Check if the error came from the backing store (and might clear up
    /// when connectivity is restored).
    pub fn is_retryable(&self) -> bool {
        matches!(self, MetaError::Backend { .. })
    }
}

/// Result type alias for metadata-coordination operations.
pub type Result<T> = std::result::Result<T, MetaError>;
