//! Image UUIDs
//!
//! Every image carries a 16-byte UUID in its header. The loader prints it
//! in the usual 8-4-4-4-12 form and accepts the same form on the command
//! line for `uuid:`-prefixed image lookups.

use core::fmt;
use core::str::FromStr;

/// A 16-byte image UUID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct ImageUuid(pub [u8; 16]);

/// Error parsing a textual UUID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParseUuidError;

impl fmt::Display for ParseUuidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed UUID")
    }
}

impl fmt::Display for ImageUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
        )
    }
}

const fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

impl FromStr for ImageUuid {
    type Err = ParseUuidError;

    /// Parse the hyphenated 8-4-4-4-12 form, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.as_bytes();
        if text.len() != 36 {
            return Err(ParseUuidError);
        }

        let mut bytes = [0u8; 16];
        let mut out = 0;
        let mut i = 0;
        while i < text.len() {
            if matches!(i, 8 | 13 | 18 | 23) {
                if text[i] != b'-' {
                    return Err(ParseUuidError);
                }
                i += 1;
                continue;
            }
            let high = hex_value(text[i]).ok_or(ParseUuidError)?;
            let low = hex_value(text[i + 1]).ok_or(ParseUuidError)?;
            bytes[out] = (high << 4) | low;
            out += 1;
            i += 2;
        }

        Ok(Self(bytes))
    }
}
