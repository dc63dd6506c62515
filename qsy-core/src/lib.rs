//! # qsy-core
//!
//! Core abstractions shared by every layer of the QSY terminal.
//!
//! This crate provides the pieces that carry no socket or task ownership of
//! their own:
//!
//! - **Wire format**: the fixed 16-byte QSY frame ([`QsyPacket`], [`encode`], [`decode`])
//! - **Palette**: the eight canonical node colors ([`Color`])
//! - **Event bus**: actor-style publish/subscribe ([`EventBus`])
//! - **Internal events**: what workers hand to the orchestrator ([`InternalEvent`])
//! - **Time provider**: sleeping and clock reads behind a trait ([`TimeProvider`])
//!
//! ## Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    qsy (Terminal facade)                    │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  qsy-transport               │  qsy-routine                 │
//! │  • multicast discovery       │  • routine model             │
//! │  • TCP receiver / sender     │  • expression tree           │
//! │  • keepalive monitor         │  • executor state machine    │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │                    qsy-core (this crate)                    │
//! │  Color, QsyPacket + codec, EventBus, InternalEvent, Time    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod bus;
mod color;
mod events;
mod packet;
pub mod protocol;
mod time;
mod wire;

// Event bus exports
pub use bus::{EventBus, Publisher, Subscription};

// Palette exports
pub use color::Color;

// Event exports
pub use events::{ExecutionEvent, ExecutionId, InternalEvent};

// Packet exports
pub use packet::{CommandArgs, PacketType, PhysicalId, QsyPacket};

// Time exports
pub use time::{TimeError, TimeProvider, TokioTimeProvider};

// Wire format exports
pub use wire::{MalformedPacket, WireError, decode, encode};
