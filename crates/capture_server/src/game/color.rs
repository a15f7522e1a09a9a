//! The fixed player color palette.

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One of the eight player colors. Serialized as its hex code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub enum Color {
    Red,
    Green,
    Blue,
    Yellow,
    Magenta,
    Cyan,
    Orange,
    White,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not a palette color")]
pub struct ParseColorError(pub String);

impl Color {
    /// Palette in seating-suggestion order.
    pub const PALETTE: [Color; 8] = [
        Color::Red,
        Color::Green,
        Color::Blue,
        Color::Yellow,
        Color::Magenta,
        Color::Cyan,
        Color::Orange,
        Color::White,
    ];

    pub fn hex(self) -> &'static str {
        match self {
            Color::Red => "#FF0000",
            Color::Green => "#00FF00",
            Color::Blue => "#0000FF",
            Color::Yellow => "#FFFF00",
            Color::Magenta => "#FF00FF",
            Color::Cyan => "#00FFFF",
            Color::Orange => "#FF7F00",
            Color::White => "#FFFFFF",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.hex())
    }
}

impl FromStr for Color {
    type Err = ParseColorError;

    /// Accepts a hex code in any case (`#ff0000`) or a color name (`red`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Color::PALETTE
            .into_iter()
            .find(|color| {
                color.hex().eq_ignore_ascii_case(wanted)
                    || format!("{color:?}").eq_ignore_ascii_case(wanted)
            })
            .ok_or_else(|| ParseColorError(s.to_string()))
    }
}

impl TryFrom<String> for Color {
    type Error = ParseColorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Serialize for Color {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.hex())
    }
}
