//! Error types for transport operations.

use std::io;
use thiserror::Error;

/// Errors surfaced by the transport workers.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket setup or group membership failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The worker was already shut down.
    #[error("{worker} is closed")]
    Closed {
        /// Worker name.
        worker: &'static str,
    },
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
