//! The QSY packet record.
//!
//! A [`QsyPacket`] is the decoded form of one 16-byte frame. Packets are
//! immutable once built. Outbound command packets are built through
//! [`QsyPacket::command`], which range-checks the caller's arguments;
//! inbound packets come out of [`crate::decode`] and always carry the
//! address of the node that sent them.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::color::Color;
use crate::wire::{MalformedPacket, WireError};

/// Identifier a node reports for itself; unique on the network.
pub type PhysicalId = u16;

/// Kind of frame, carried in byte 3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Node announcement on the multicast group.
    Hello,
    /// Light command from the terminal to a node.
    Command,
    /// A node was touched.
    Touche,
    /// Periodic liveness heartbeat.
    Keepalive,
}

impl PacketType {
    /// Wire value of this type.
    pub fn as_byte(self) -> u8 {
        match self {
            PacketType::Hello => 0x00,
            PacketType::Command => 0x01,
            PacketType::Touche => 0x02,
            PacketType::Keepalive => 0x03,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = MalformedPacket;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::Hello),
            0x01 => Ok(PacketType::Command),
            0x02 => Ok(PacketType::Touche),
            0x03 => Ok(PacketType::Keepalive),
            _ => Err(MalformedPacket::UnknownPacketType { value }),
        }
    }
}

/// Caller-supplied arguments of a light command.
///
/// Fields are wider than their wire representation so that range errors
/// surface as [`WireError::InvalidCommand`] instead of silent truncation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandArgs {
    /// Destination node.
    pub physical_id: u32,
    /// Color to display.
    pub color: Color,
    /// Milliseconds the node waits before lighting up.
    pub delay: u64,
    /// Step sequence number the command belongs to (0 outside any step).
    pub step: u16,
    /// Enable the touch (distance) sensor.
    pub touch: bool,
    /// Enable the buzzer.
    pub sound: bool,
}

impl CommandArgs {
    /// Command with both sensor flags disabled.
    pub fn new(physical_id: u32, color: Color, delay: u64, step: u16) -> Self {
        Self {
            physical_id,
            color,
            delay,
            step,
            touch: false,
            sound: false,
        }
    }

    /// Set the touch flag.
    pub fn with_touch(mut self, touch: bool) -> Self {
        self.touch = touch;
        self
    }

    /// Set the sound flag.
    pub fn with_sound(mut self, sound: bool) -> Self {
        self.sound = sound;
        self
    }
}

/// One decoded QSY frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QsyPacket {
    kind: PacketType,
    physical_id: PhysicalId,
    color: Color,
    delay: u32,
    step: u16,
    touch: bool,
    sound: bool,
    source: Option<IpAddr>,
}

impl QsyPacket {
    /// Bare packet of the given type: color off, no delay, step 0, flags cleared.
    pub fn new(kind: PacketType, physical_id: PhysicalId) -> Self {
        Self {
            kind,
            physical_id,
            color: Color::OFF,
            delay: 0,
            step: 0,
            touch: false,
            sound: false,
            source: None,
        }
    }

    /// Build an outbound command packet.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::InvalidCommand`] when the physical id does not fit
    /// in 16 bits or the delay does not fit in 32 bits.
    pub fn command(args: &CommandArgs) -> Result<Self, WireError> {
        let physical_id =
            PhysicalId::try_from(args.physical_id).map_err(|_| WireError::InvalidCommand {
                field: "physical_id",
                value: u64::from(args.physical_id),
            })?;
        let delay = u32::try_from(args.delay).map_err(|_| WireError::InvalidCommand {
            field: "delay",
            value: args.delay,
        })?;

        Ok(Self {
            kind: PacketType::Command,
            physical_id,
            color: *args.color.canonical(),
            delay,
            step: args.step,
            touch: args.touch,
            sound: args.sound,
            source: None,
        })
    }

    /// Replace the color.
    pub fn with_color(mut self, color: Color) -> Self {
        self.color = color;
        self
    }

    /// Replace the delay, in milliseconds.
    pub fn with_delay(mut self, delay: u32) -> Self {
        self.delay = delay;
        self
    }

    /// Replace the step number.
    pub fn with_step(mut self, step: u16) -> Self {
        self.step = step;
        self
    }

    /// Replace both sensor flags.
    pub fn with_flags(mut self, touch: bool, sound: bool) -> Self {
        self.touch = touch;
        self.sound = sound;
        self
    }

    /// Attach the sender address (inbound packets).
    pub fn with_source(mut self, source: IpAddr) -> Self {
        self.source = Some(source);
        self
    }

    /// Packet type.
    pub fn kind(&self) -> PacketType {
        self.kind
    }

    /// Node the packet comes from or goes to.
    pub fn physical_id(&self) -> PhysicalId {
        self.physical_id
    }

    /// Color field.
    pub fn color(&self) -> Color {
        self.color
    }

    /// Delay field in milliseconds.
    pub fn delay(&self) -> u32 {
        self.delay
    }

    /// Delay field as a duration.
    pub fn delay_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.delay))
    }

    /// Step sequence number.
    pub fn step(&self) -> u16 {
        self.step
    }

    /// Touch sensor flag.
    pub fn touch_enabled(&self) -> bool {
        self.touch
    }

    /// Sound flag.
    pub fn sound_enabled(&self) -> bool {
        self.sound
    }

    /// Address of the sending node; `None` for outbound packets.
    pub fn source(&self) -> Option<IpAddr> {
        self.source
    }
}

impl fmt::Display for QsyPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} id={} color={} delay={}ms step={} touch={} sound={}",
            self.kind, self.physical_id, self.color, self.delay, self.step, self.touch, self.sound
        )?;
        if let Some(source) = self.source {
            write!(f, " from={}", source)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_rejects_wide_physical_id() {
        let args = CommandArgs::new(70_000, Color::RED, 0, 1);
        let result = QsyPacket::command(&args);
        assert!(matches!(
            result,
            Err(WireError::InvalidCommand {
                field: "physical_id",
                value: 70_000
            })
        ));
    }

    #[test]
    fn test_command_rejects_wide_delay() {
        let args = CommandArgs::new(1, Color::RED, u64::from(u32::MAX) + 1, 1);
        assert!(matches!(
            QsyPacket::command(&args),
            Err(WireError::InvalidCommand { field: "delay", .. })
        ));
    }

    #[test]
    fn test_command_fields() {
        let args = CommandArgs::new(u32::from(u16::MAX), Color::CYAN, u64::from(u32::MAX), 42)
            .with_touch(true);
        let packet = QsyPacket::command(&args).expect("valid command");

        assert_eq!(packet.kind(), PacketType::Command);
        assert_eq!(packet.physical_id(), u16::MAX);
        assert_eq!(packet.color(), Color::CYAN);
        assert_eq!(packet.delay(), u32::MAX);
        assert_eq!(packet.step(), 42);
        assert!(packet.touch_enabled());
        assert!(!packet.sound_enabled());
        assert_eq!(packet.source(), None);
    }

    #[test]
    fn test_packet_type_bytes() {
        for kind in [
            PacketType::Hello,
            PacketType::Command,
            PacketType::Touche,
            PacketType::Keepalive,
        ] {
            assert_eq!(PacketType::try_from(kind.as_byte()), Ok(kind));
        }
        assert_eq!(
            PacketType::try_from(4),
            Err(MalformedPacket::UnknownPacketType { value: 4 })
        );
    }

    #[test]
    fn test_display() {
        let packet = QsyPacket::new(PacketType::Touche, 7)
            .with_color(Color::GREEN)
            .with_step(3)
            .with_source(IpAddr::from([10, 0, 0, 7]));
        let text = packet.to_string();
        assert!(text.starts_with("Touche id=7 color=green"));
        assert!(text.ends_with("from=10.0.0.7"));
    }
}
