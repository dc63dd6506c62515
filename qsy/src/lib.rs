//! # qsy
//!
//! Terminal for networked QSY light/touch nodes.
//!
//! The terminal discovers nodes over multicast, keeps a TCP control
//! connection to each, watches their heartbeats and drives them through
//! routines: sequences of timed light commands that advance when a boolean
//! condition over the touched nodes becomes true.
//!
//! ## Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    qsy (this crate)                         │
//! │   Terminal orchestrator + re-exports of the layers below    │
//! ├──────────────────────────┬──────────────────────────────────┤
//! │  qsy-transport           │       qsy-routine                │
//! │  • Multicast discovery   │       • Routine model + JSON     │
//! │  • TCP receiver / sender │       • Expression trees         │
//! │  • KeepAlive monitor     │       • Executor state machine   │
//! │                          │       • Player game              │
//! ├──────────────────────────┴──────────────────────────────────┤
//! │                       qsy-core                              │
//! │  Wire codec, Color, packets, event bus, time provider       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Which Crate to Use
//!
//! | Use case | Crate |
//! |----------|-------|
//! | Drive nodes (recommended) | `qsy` |
//! | Frame encoding and event bus only | `qsy-core` |
//! | Network workers without orchestration | `qsy-transport` |
//! | Routine model and validation | `qsy-routine` |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export all public items from sub-crates
pub use qsy_core::*;
pub use qsy_routine::*;
pub use qsy_transport::*;

// =============================================================================
// Modules
// =============================================================================

mod config;
mod controller;
mod error;
mod events;
mod node;
mod terminal;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::TerminalConfig;
pub use error::{TerminalError, TerminalResult};
pub use events::{ExternalEvent, InterruptionReason, ToucheArgs};
pub use node::Node;
pub use terminal::Terminal;
