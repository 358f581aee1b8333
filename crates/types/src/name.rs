//! Compact producer account names.
//!
//! Names are lowercase strings over the alphabet `.12345a-z`, at most 11
//! characters, packed 5 bits per character into a `u64`. The packed value
//! always fits in 56 bits, so the wire form is exactly 7 little-endian
//! bytes.

use crate::wire::{get_bytes, put_bytes, WireDecode, WireEncode, WireError, WireResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Maximum name length in characters.
pub const MAX_NAME_LEN: usize = 11;

/// Errors from parsing an account name.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NameError {
    /// Name longer than [`MAX_NAME_LEN`] characters
    #[error("name too long: {0} characters (max {MAX_NAME_LEN})")]
    TooLong(usize),

    /// Character outside `.12345a-z`
    #[error("invalid character {0:?} in name")]
    InvalidChar(char),
}

/// A packed producer account name.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AccountName(u64);

fn char_to_symbol(c: char) -> Option<u64> {
    match c {
        '.' => Some(0),
        '1'..='5' => Some(c as u64 - '1' as u64 + 1),
        'a'..='z' => Some(c as u64 - 'a' as u64 + 6),
        _ => None,
    }
}

fn symbol_to_char(s: u64) -> char {
    match s {
        0 => '.',
        1..=5 => (b'1' + (s as u8 - 1)) as char,
        _ => (b'a' + (s as u8 - 6)) as char,
    }
}

impl AccountName {
    /// The empty name.
    pub const EMPTY: AccountName = AccountName(0);

    /// Construct from an already-packed value. Values must fit in 56 bits.
    pub fn from_raw(value: u64) -> WireResult<Self> {
        if value >= 1 << 56 {
            return Err(WireError::InvalidValue("account name exceeds 56 bits"));
        }
        Ok(Self(value))
    }

    /// The packed 56-bit value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Whether this is the empty name.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Render back to the string form, trimming trailing dots.
    pub fn to_string_repr(&self) -> String {
        let mut out = String::with_capacity(MAX_NAME_LEN);
        for i in 0..MAX_NAME_LEN {
            let shift = 5 * (MAX_NAME_LEN - 1 - i);
            let symbol = (self.0 >> shift) & 0x1f;
            out.push(symbol_to_char(symbol));
        }
        while out.ends_with('.') {
            out.pop();
        }
        out
    }
}

impl FromStr for AccountName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > MAX_NAME_LEN {
            return Err(NameError::TooLong(s.len()));
        }
        let mut value: u64 = 0;
        for i in 0..MAX_NAME_LEN {
            let symbol = match s.chars().nth(i) {
                Some(c) => char_to_symbol(c).ok_or(NameError::InvalidChar(c))?,
                None => 0,
            };
            value = (value << 5) | symbol;
        }
        Ok(Self(value))
    }
}

impl fmt::Display for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_repr())
    }
}

impl fmt::Debug for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountName({})", self.to_string_repr())
    }
}

impl Serialize for AccountName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string_repr())
        } else {
            serializer.serialize_u64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for AccountName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            let v = u64::deserialize(deserializer)?;
            AccountName::from_raw(v).map_err(serde::de::Error::custom)
        }
    }
}

impl WireEncode for AccountName {
    fn encode(&self, out: &mut Vec<u8>) {
        put_bytes(out, &self.0.to_le_bytes()[..7]);
    }
}

impl WireDecode for AccountName {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        let bytes = get_bytes(input, 7)?;
        let mut arr = [0u8; 8];
        arr[..7].copy_from_slice(bytes);
        Ok(Self(u64::from_le_bytes(arr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_render() {
        for name in ["alice", "prod.a", "zzzzzzzzzzz", "a1b2c3", ""] {
            let parsed: AccountName = name.parse().unwrap();
            assert_eq!(parsed.to_string_repr(), name);
        }
    }

    #[test]
    fn test_rejects_bad_names() {
        assert_eq!(
            "toolongname1".parse::<AccountName>(),
            Err(NameError::TooLong(12))
        );
        assert_eq!(
            "UPPER".parse::<AccountName>(),
            Err(NameError::InvalidChar('U'))
        );
        assert_eq!("a_b".parse::<AccountName>(), Err(NameError::InvalidChar('_')));
    }

    #[test]
    fn test_packed_value_fits_wire_width() {
        let name: AccountName = "zzzzzzzzzzz".parse().unwrap();
        assert!(name.as_raw() < 1 << 56);
    }

    #[test]
    fn test_wire_round_trip() {
        let name: AccountName = "producer.a".parse().unwrap();
        let bytes = name.to_wire_bytes();
        assert_eq!(bytes.len(), 7);
        assert_eq!(AccountName::from_wire_bytes(&bytes).unwrap(), name);
    }

    #[test]
    fn test_ordering_matches_packing() {
        let a: AccountName = "aaa".parse().unwrap();
        let b: AccountName = "aab".parse().unwrap();
        assert!(a < b);
    }
}
