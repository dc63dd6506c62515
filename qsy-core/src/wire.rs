//! Wire format for QSY frames.
//!
//! Frame format (16 bytes, multi-byte fields big-endian):
//!
//! ```text
//! [0..3)   signature "QSY"
//! [3]      packet type (0 hello, 1 command, 2 touche, 3 keepalive)
//! [4..6)   physical id
//! [6..8)   color: nibbles R, G, B, 0
//! [8..12)  delay in milliseconds
//! [12..14) step sequence number
//! [14..16) flags: bit 1 touch, bit 0 sound
//! ```
//!
//! The same frame travels in multicast discovery datagrams and on the
//! per-node TCP streams.

use std::net::IpAddr;

use crate::color::Color;
use crate::packet::{PacketType, QsyPacket};
use crate::protocol::{PACKET_SIZE, SIGNATURE};

const TYPE_INDEX: usize = 3;
const ID_INDEX: usize = 4;
const COLOR_INDEX: usize = 6;
const DELAY_INDEX: usize = 8;
const STEP_INDEX: usize = 12;
const FLAGS_INDEX: usize = 14;

const FLAG_TOUCH: u16 = 0x0002;
const FLAG_SOUND: u16 = 0x0001;

/// Ways an inbound frame can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MalformedPacket {
    /// Frame is not exactly [`PACKET_SIZE`] bytes.
    #[error("invalid frame length: {length} bytes (expected {PACKET_SIZE})")]
    InvalidLength {
        /// Length that was received.
        length: usize,
    },

    /// Frame does not start with `"QSY"`.
    #[error("invalid signature: {found:02x?}")]
    InvalidSignature {
        /// First three bytes of the frame.
        found: [u8; 3],
    },

    /// Type byte is not a known [`PacketType`].
    #[error("unknown packet type: {value:#04x}")]
    UnknownPacketType {
        /// The unrecognized type byte.
        value: u8,
    },
}

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// A command argument does not fit its wire field.
    #[error("invalid command: {field} = {value} is out of range")]
    InvalidCommand {
        /// Name of the offending argument.
        field: &'static str,
        /// The rejected value.
        value: u64,
    },

    /// An inbound frame could not be decoded.
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] MalformedPacket),
}

/// Serialize a packet into its 16-byte frame.
///
/// # Examples
///
/// ```
/// use qsy_core::{Color, CommandArgs, QsyPacket, encode, decode};
///
/// let packet = QsyPacket::command(&CommandArgs::new(12, Color::RED, 250, 3)).expect("command");
/// let frame = encode(&packet);
/// assert_eq!(&frame[..3], b"QSY");
///
/// let decoded = decode(&frame, "10.0.0.12".parse().expect("ip")).expect("decode");
/// assert_eq!(decoded.physical_id(), 12);
/// assert_eq!(decoded.color(), Color::RED);
/// ```
pub fn encode(packet: &QsyPacket) -> [u8; PACKET_SIZE] {
    let mut frame = [0u8; PACKET_SIZE];
    frame[..TYPE_INDEX].copy_from_slice(&SIGNATURE);
    frame[TYPE_INDEX] = packet.kind().as_byte();
    frame[ID_INDEX..COLOR_INDEX].copy_from_slice(&packet.physical_id().to_be_bytes());
    frame[COLOR_INDEX..DELAY_INDEX].copy_from_slice(&packet.color().to_wire().to_be_bytes());
    frame[DELAY_INDEX..STEP_INDEX].copy_from_slice(&packet.delay().to_be_bytes());
    frame[STEP_INDEX..FLAGS_INDEX].copy_from_slice(&packet.step().to_be_bytes());

    let mut flags = 0u16;
    if packet.touch_enabled() {
        flags |= FLAG_TOUCH;
    }
    if packet.sound_enabled() {
        flags |= FLAG_SOUND;
    }
    frame[FLAGS_INDEX..].copy_from_slice(&flags.to_be_bytes());

    frame
}

/// Deserialize a frame received from `source`.
///
/// # Errors
///
/// - `InvalidLength`: `data` is not exactly 16 bytes
/// - `InvalidSignature`: the frame does not start with `"QSY"`
/// - `UnknownPacketType`: the type byte is not recognized
pub fn decode(data: &[u8], source: IpAddr) -> Result<QsyPacket, MalformedPacket> {
    if data.len() != PACKET_SIZE {
        return Err(MalformedPacket::InvalidLength { length: data.len() });
    }
    if data[..TYPE_INDEX] != SIGNATURE {
        return Err(MalformedPacket::InvalidSignature {
            found: [data[0], data[1], data[2]],
        });
    }

    let kind = PacketType::try_from(data[TYPE_INDEX])?;
    let physical_id = u16::from_be_bytes([data[ID_INDEX], data[ID_INDEX + 1]]);
    let color = Color::from_wire(u16::from_be_bytes([
        data[COLOR_INDEX],
        data[COLOR_INDEX + 1],
    ]));
    let delay = u32::from_be_bytes([
        data[DELAY_INDEX],
        data[DELAY_INDEX + 1],
        data[DELAY_INDEX + 2],
        data[DELAY_INDEX + 3],
    ]);
    let step = u16::from_be_bytes([data[STEP_INDEX], data[STEP_INDEX + 1]]);
    let flags = u16::from_be_bytes([data[FLAGS_INDEX], data[FLAGS_INDEX + 1]]);

    Ok(QsyPacket::new(kind, physical_id)
        .with_color(color)
        .with_delay(delay)
        .with_step(step)
        .with_flags(flags & FLAG_TOUCH != 0, flags & FLAG_SOUND != 0)
        .with_source(source))
}
