//! Error types for the terminal.

use std::io;

use qsy_core::WireError;
use qsy_routine::RoutineError;
use qsy_transport::TransportError;
use thiserror::Error;

/// Errors returned by [`crate::Terminal`] operations.
#[derive(Debug, Error)]
pub enum TerminalError {
    /// The terminal has not been started.
    #[error("terminal is not running")]
    NotRunning,

    /// The terminal was closed and cannot be used again.
    #[error("terminal is closed")]
    Closed,

    /// The execution needs more nodes than are connected.
    #[error("not enough connected nodes: {required} required, {connected} connected")]
    NotEnoughNodes {
        /// Logical nodes the execution uses.
        required: usize,
        /// Nodes connected when the execution was requested.
        connected: usize,
    },

    /// The routine or player execution was rejected before starting.
    #[error("invalid execution: {0}")]
    InvalidExecution(#[from] RoutineError),

    /// A command could not be encoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// A transport worker failed to start.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Socket setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for terminal operations.
pub type TerminalResult<T> = Result<T, TerminalError>;
