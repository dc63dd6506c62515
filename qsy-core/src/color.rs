//! The node color palette.
//!
//! Nodes drive three 4-bit channels, but only `0x0` and `0xF` are meaningful
//! per channel, which yields exactly eight colors. Every [`Color`] handed out
//! by this module is one of those eight, and [`Color::from_nibbles`] always
//! returns a reference into the same static palette, so canonical instances
//! are reference-stable for the lifetime of the process.
//!
//! ```
//! use qsy_core::Color;
//!
//! let red = Color::from_nibbles(0xF, 0x3, 0x0);
//! assert_eq!(*red, Color::RED);
//! assert!(std::ptr::eq(red, Color::from_nibbles(0xF, 0x0, 0x0)));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Channel value meaning "fully on".
const CHANNEL_ON: u8 = 0x0F;

/// Channel value meaning "off".
const CHANNEL_OFF: u8 = 0x00;

/// The eight canonical colors, indexed by `blue + 2 * green + 4 * red`.
static PALETTE: [Color; 8] = [
    Color::OFF,
    Color::BLUE,
    Color::GREEN,
    Color::CYAN,
    Color::RED,
    Color::MAGENTA,
    Color::YELLOW,
    Color::WHITE,
];

/// Palette names, same indexing as [`PALETTE`].
const NAMES: [&str; 8] = [
    "off", "blue", "green", "cyan", "red", "magenta", "yellow", "white",
];

/// One of the eight colors a node can display.
///
/// Equality and hashing are by channel triple. Values can only be obtained
/// from the associated constants or the palette factory, so a `Color` is
/// always canonical.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(from = "Channels")]
pub struct Color {
    red: u8,
    green: u8,
    blue: u8,
}

impl Color {
    /// All channels off. Also used as "no color".
    pub const OFF: Color = Color::raw(CHANNEL_OFF, CHANNEL_OFF, CHANNEL_OFF);
    /// Blue channel only.
    pub const BLUE: Color = Color::raw(CHANNEL_OFF, CHANNEL_OFF, CHANNEL_ON);
    /// Green channel only.
    pub const GREEN: Color = Color::raw(CHANNEL_OFF, CHANNEL_ON, CHANNEL_OFF);
    /// Green and blue.
    pub const CYAN: Color = Color::raw(CHANNEL_OFF, CHANNEL_ON, CHANNEL_ON);
    /// Red channel only.
    pub const RED: Color = Color::raw(CHANNEL_ON, CHANNEL_OFF, CHANNEL_OFF);
    /// Red and blue.
    pub const MAGENTA: Color = Color::raw(CHANNEL_ON, CHANNEL_OFF, CHANNEL_ON);
    /// Red and green.
    pub const YELLOW: Color = Color::raw(CHANNEL_ON, CHANNEL_ON, CHANNEL_OFF);
    /// All channels on.
    pub const WHITE: Color = Color::raw(CHANNEL_ON, CHANNEL_ON, CHANNEL_ON);

    const fn raw(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    /// Map any channel triple to its canonical palette entry.
    ///
    /// Each channel is thresholded independently: `>= 0xF` is on, anything
    /// lower is off. Total and idempotent.
    pub fn from_nibbles(red: u8, green: u8, blue: u8) -> &'static Color {
        let index = usize::from(blue >= CHANNEL_ON)
            + 2 * usize::from(green >= CHANNEL_ON)
            + 4 * usize::from(red >= CHANNEL_ON);
        &PALETTE[index]
    }

    /// The full palette in index order.
    pub fn palette() -> &'static [Color; 8] {
        &PALETTE
    }

    /// The interned palette entry equal to this color.
    pub fn canonical(&self) -> &'static Color {
        Self::from_nibbles(self.red, self.green, self.blue)
    }

    /// Red channel nibble.
    pub fn red(&self) -> u8 {
        self.red
    }

    /// Green channel nibble.
    pub fn green(&self) -> u8 {
        self.green
    }

    /// Blue channel nibble.
    pub fn blue(&self) -> u8 {
        self.blue
    }

    /// Whether every channel is off.
    pub fn is_off(&self) -> bool {
        *self == Color::OFF
    }

    /// Human readable palette name.
    pub fn name(&self) -> &'static str {
        NAMES[self.index()]
    }

    fn index(&self) -> usize {
        usize::from(self.blue == CHANNEL_ON)
            + 2 * usize::from(self.green == CHANNEL_ON)
            + 4 * usize::from(self.red == CHANNEL_ON)
    }

    /// Pack into the frame's color field: nibbles `R, G, B, 0`, most significant first.
    pub(crate) fn to_wire(self) -> u16 {
        (u16::from(self.red) << 12) | (u16::from(self.green) << 8) | (u16::from(self.blue) << 4)
    }

    /// Unpack the frame's color field, snapping to the palette.
    pub(crate) fn from_wire(value: u16) -> Color {
        let red = ((value >> 12) & 0x0F) as u8;
        let green = ((value >> 8) & 0x0F) as u8;
        let blue = ((value >> 4) & 0x0F) as u8;
        *Self::from_nibbles(red, green, blue)
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::OFF
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Serialized shape of a color: `{ "red": .., "green": .., "blue": .. }`.
#[derive(Deserialize)]
struct Channels {
    red: u8,
    green: u8,
    blue: u8,
}

impl From<Channels> for Color {
    fn from(channels: Channels) -> Self {
        *Color::from_nibbles(channels.red, channels.green, channels.blue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_factory_is_total() {
        let mut seen = HashSet::new();
        for red in 0..=0xFF_u8 {
            for green in [0x0, 0x7, 0xE, 0xF, 0x10, 0xFF] {
                for blue in [0x0, 0x1, 0xF] {
                    let color = Color::from_nibbles(red, green, blue);
                    assert!(Color::palette().iter().any(|c| std::ptr::eq(c, color)));
                    seen.insert(*color);
                }
            }
        }
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn test_factory_is_idempotent() {
        for color in Color::palette() {
            let again = Color::from_nibbles(color.red(), color.green(), color.blue());
            assert!(std::ptr::eq(color, again));
            assert!(std::ptr::eq(color, color.canonical()));
        }
    }

    #[test]
    fn test_thresholding() {
        assert_eq!(*Color::from_nibbles(0xE, 0xE, 0xE), Color::OFF);
        assert_eq!(*Color::from_nibbles(0xF, 0x0, 0xF), Color::MAGENTA);
        assert_eq!(*Color::from_nibbles(0x0, 0xF, 0x2), Color::GREEN);
    }

    #[test]
    fn test_wire_packing() {
        assert_eq!(Color::WHITE.to_wire(), 0xFFF0);
        assert_eq!(Color::RED.to_wire(), 0xF000);
        assert_eq!(Color::BLUE.to_wire(), 0x00F0);
        for color in Color::palette() {
            assert_eq!(Color::from_wire(color.to_wire()), *color);
        }
        // Low nibble is padding and must be ignored.
        assert_eq!(Color::from_wire(0x0F0F), Color::GREEN);
    }

    #[test]
    fn test_names() {
        assert_eq!(Color::OFF.to_string(), "off");
        assert_eq!(Color::CYAN.to_string(), "cyan");
        assert_eq!(Color::YELLOW.name(), "yellow");
    }

    #[test]
    fn test_json_snaps_to_palette() {
        let color: Color =
            serde_json::from_str(r#"{"red": 15, "green": 9, "blue": 15}"#).expect("deserialize");
        assert_eq!(color, Color::MAGENTA);

        let json = serde_json::to_string(&Color::CYAN).expect("serialize");
        assert_eq!(json, r#"{"red":0,"green":15,"blue":15}"#);
    }
}
