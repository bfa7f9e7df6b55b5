// Copyright (c) 2025-2026 The commitlog-replay authors. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replay pipeline.
//!
//! Expected control-flow outcomes are **not** errors: a disabled config or a
//! held replication lock is reported through [`ReplayOutcome`](crate::replay::ReplayOutcome),
//! never through this enum. Everything here aborts the current run.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |---------------------|-----------|-------------|
//! | `Blob` | Yes | Object-store listing/fetch failures |
//! | `Store` | Yes | SQL store failures (apply, watermark, lock, checkpoint) |
//! | `CatalogIncomplete` | No | Diff files do not tile the replay window |
//! | `Decode` | No | Malformed diff file or entity payload |
//! | `Config` | No | Configuration invalid |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! "Retry" means the next scheduled tick: every apply operation is
//! idempotent and the watermark only advances past fully-consumed files, so
//! a retryable failure simply resumes from the last watermark. Use
//! [`ReplayError::is_retryable()`] to decide whether an alert is warranted.
//! `CatalogIncomplete` and `Decode` indicate missing or corrupted export
//! output and need operator attention.

use thiserror::Error;

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Errors that abort a replay, checkpoint, or catalog run.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// Object-store listing or fetch failure.
    ///
    /// Blobs are immutable, so these are always transient I/O problems.
    /// Retryable on the next scheduled tick.
    #[error("Object store error ({operation}): {source}")]
    Blob {
        operation: String,
        #[source]
        source: object_store::Error,
    },

    /// SQL store failure: entity apply, watermark, lock, or checkpoint.
    ///
    /// Retryable on the next tick - the watermark never advances past a
    /// partially-applied file, and every operation is idempotent.
    #[error("SQL store error: {0}")]
    Store(#[from] sqlx::Error),

    /// The diff files in the bucket do not exactly cover the replay window.
    ///
    /// A gap would silently drop transactions; an overlap would indicate a
    /// duplicated export cycle. Either way the run aborts and an operator
    /// must inspect the export output. Not retryable.
    #[error(
        "Commit log diff files do not cover ({window_start}, {window_end}]: {detail}"
    )]
    CatalogIncomplete {
        window_start: chrono::DateTime<chrono::Utc>,
        window_end: chrono::DateTime<chrono::Utc>,
        detail: String,
    },

    /// Malformed diff file or entity payload.
    ///
    /// The data is corrupt at the source. Not retryable.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Invalid or missing configuration.
    ///
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected internal error.
    ///
    /// Catch-all for conditions that shouldn't happen. Not retryable.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplayError {
    /// Create a blob error tagged with the object-store operation that failed.
    pub fn blob(operation: impl Into<String>, source: object_store::Error) -> Self {
        Self::Blob {
            operation: operation.into(),
            source,
        }
    }

    /// Check if the next scheduled tick can safely retry this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Blob { .. } => true,
            Self::Store(_) => true,
            Self::CatalogIncomplete { .. } => false, // Missing export output
            Self::Decode(_) => false,                // Data corruption
            Self::Config(_) => false,
            Self::Internal(_) => false,
        }
    }
}
