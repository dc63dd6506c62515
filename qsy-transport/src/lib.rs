//! # qsy-transport
//!
//! Network workers for the QSY terminal.
//!
//! This crate provides:
//! - **MulticastReceiver**: Hello discovery over UDP, gated by a discovery window
//! - **Receiver**: one task multiplexing every node TCP stream
//! - **Sender**: one task draining the outbound command queue
//! - **KeepAlive**: heartbeat tracking and dead-node detection
//!
//! Every worker depends only on the wire codec and the event bus from
//! `qsy-core`; none of them knows about the others.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Stream framing for node connections.
pub mod codec;

/// Worker configuration.
pub mod config;

/// Error types for transport operations.
pub mod error;

/// Liveness monitor.
pub mod keepalive;

/// Multicast discovery worker.
pub mod multicast;

/// Multiplexed node stream reader.
pub mod receiver;

/// Outbound command writer.
pub mod sender;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use codec::QsyCodec;
pub use config::{DiscoveryConfig, KeepAliveConfig, SenderConfig};
pub use error::{TransportError, TransportResult};
pub use keepalive::KeepAlive;
pub use multicast::MulticastReceiver;
pub use receiver::Receiver;
pub use sender::{Sender, SenderHandle};
