//! Typed error handling for the transmission core.
//!
//! The taxonomy distinguishes conditions callers react to differently:
//! - Timeouts - do not retry the same connection
//! - Incomplete writes - retry budget exhausted, not a plain I/O fault
//! - Header-change failures - recoverable, try another transport
//! - Filter failures - carry the most specific sub-cause available
//!
//! None of these terminate the process on their own; that decision
//! belongs to the caller.

use std::{io, process::ExitStatus, time::Duration};

use thiserror::Error;

/// Errors surfaced by the message write path.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The configured deadline fired before the operation completed.
    ///
    /// Surfaced distinctly from a generic I/O failure so callers can
    /// avoid retrying on the same connection.
    #[error("Write timed out after {0:?}")]
    Timeout(Duration),

    /// The retry budget was exhausted without completing the block.
    ///
    /// Distinct from a raw I/O error: it indicates a logic or
    /// environment problem rather than a simple transient fault.
    #[error("Incomplete write: {written} of {expected} bytes after {attempts} attempts")]
    WriteIncomplete {
        written: usize,
        expected: usize,
        attempts: u32,
    },

    /// A non-transient I/O failure, preserved from the underlying call.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Header selection, expansion, or rewriting failed.
    #[error("Failed to expand or rewrite message headers: {0}")]
    HeaderChange(String),

    /// The chunk-framing callback returned a non-success code.
    #[error("Chunk callback rejected the write: {0}")]
    Chunk(String),

    /// The external transport filter failed.
    #[error("Transport filter failed: {0}")]
    Filter(#[from] FilterError),
}

impl TransportError {
    /// Returns `true` if the failure was a fired deadline.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Filter(FilterError::TimedOut(_))
        )
    }

    /// Returns `true` if the failure came from the filter pipeline.
    #[must_use]
    pub const fn is_filter(&self) -> bool {
        matches!(self, Self::Filter(_))
    }

    /// Returns `true` for conditions a caller may retry on a fresh
    /// connection (timeouts and plain I/O faults).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Io(_))
    }
}

/// Sub-causes of a filter pipeline failure.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The filter program could not be started.
    #[error("Failed to spawn filter process: {0}")]
    Spawn(io::Error),

    /// A read from the filter's output missed its deadline.
    #[error("Filter timed out after {0:?}")]
    TimedOut(Duration),

    /// The filter process exited abnormally or with a non-zero status.
    #[error("Filter process failed: {0}")]
    Exit(ExitStatus),

    /// The writer finished without delivering its outcome report.
    #[error("Filter process failed: writer outcome missing")]
    Report,
}

/// Errors from the connection-reuse waiting store.
///
/// Record corruption is never surfaced through here: the operations
/// contain it by purging or abandoning the affected chain.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying filesystem failure.
    #[error("Waiting store I/O error: {0}")]
    Io(#[from] io::Error),

    /// The store's mutual-exclusion lock could not be acquired in time.
    #[error("Timed out waiting for store lock at {0}")]
    Lock(String),

    /// A key that cannot be mapped to a record file.
    #[error("Invalid store key: {0}")]
    InvalidKey(String),
}
