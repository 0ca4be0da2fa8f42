//! Canonical tag identifiers.
//!
//! Readers hand over raw UID bytes in the order the card reported them. This
//! module turns those bytes into the uppercase hexadecimal form the attendance
//! service stores, and parses the textual form emitted by line-oriented readers.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// A tag UID in canonical form: uppercase hex, two digits per byte.
///
/// Only constructible from a non-empty byte sequence, so the inner string is
/// never empty and always has an even length.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagIdentifier(String);

/// Errors returned when a read cannot become a [`TagIdentifier`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TagError {
    #[error("empty tag read")]
    Empty,
    #[error("invalid tag identifier: odd number of hex digits ({0})")]
    OddLength(usize),
    #[error("invalid tag identifier: '{0}' is not valid hex")]
    InvalidHex(String),
}

impl TagIdentifier {
    /// Encode raw UID bytes, preserving reader order.
    ///
    /// # Example
    /// ```
    /// use attendance_beacon::tag::TagIdentifier;
    ///
    /// let tag = TagIdentifier::from_bytes(&[0x04, 0xA3, 0x2B]).unwrap();
    /// assert_eq!(tag.as_str(), "04A32B");
    /// ```
    pub fn from_bytes(raw: &[u8]) -> Result<Self, TagError> {
        if raw.is_empty() {
            return Err(TagError::Empty);
        }

        let mut hex = String::with_capacity(raw.len() * 2);
        for byte in raw {
            hex.push(HEX_DIGITS[usize::from(byte >> 4)] as char);
            hex.push(HEX_DIGITS[usize::from(byte & 0x0F)] as char);
        }
        Ok(Self(hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of UID bytes this identifier was built from.
    pub fn len_bytes(&self) -> usize {
        self.0.len() / 2
    }
}

/// Identifier Normalizer: raw bytes to canonical identifier.
pub fn normalize(raw: &[u8]) -> Result<TagIdentifier, TagError> {
    TagIdentifier::from_bytes(raw)
}

/// Parse a textual UID such as `04A32B`, `04:a3:2b` or `04 A3 2B` into bytes.
///
/// An input with no digits at all yields an empty vector; callers decide
/// whether that means "no tag".
pub fn parse_hex(text: &str) -> Result<Vec<u8>, TagError> {
    let digits: Vec<u8> = text
        .trim()
        .bytes()
        .filter(|b| !matches!(b, b':' | b'-' | b' '))
        .collect();

    if digits.len() % 2 != 0 {
        return Err(TagError::OddLength(digits.len()));
    }

    digits
        .chunks_exact(2)
        .map(|pair| {
            let hi = hex_value(pair[0]);
            let lo = hex_value(pair[1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
                _ => Err(TagError::InvalidHex(
                    String::from_utf8_lossy(pair).into_owned(),
                )),
            }
        })
        .collect()
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for TagIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TagIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for TagIdentifier {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(&parse_hex(s)?)
    }
}
