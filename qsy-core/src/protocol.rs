//! Protocol constants shared by nodes and the terminal.

use std::net::Ipv4Addr;
use std::time::Duration;

/// Protocol revision implemented by this crate.
pub const PROTOCOL_VERSION: u32 = 170_901;

/// Size of every QSY frame, on UDP and TCP alike.
pub const PACKET_SIZE: usize = 16;

/// Leading signature bytes of every frame.
pub const SIGNATURE: [u8; 3] = *b"QSY";

/// Multicast group nodes announce themselves on.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 12);

/// UDP port of the discovery group.
pub const MULTICAST_PORT: u16 = 3000;

/// TCP port nodes accept the control connection on.
pub const TCP_PORT: u16 = 3000;

/// Heartbeat period nodes send keepalive frames at.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(500);
