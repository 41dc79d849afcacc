//! The machine word.
//!
//! A [`Word`] is eight untagged bytes. Nothing records whether it currently
//! holds an unsigned integer, a signed integer, a float or a guest address;
//! each instruction picks the interpretation it needs through the accessors
//! below. Those accessors are the only place bit patterns are reinterpreted.

use std::fmt;

/// Untagged 8-byte machine value.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Word(u64);

impl Word {
    /// The all-zero word (unsigned 0, signed 0, +0.0, null address).
    pub const ZERO: Word = Word(0);

    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub const fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }

    pub fn from_f64(value: f64) -> Self {
        Self(value.to_bits())
    }

    pub const fn from_bool(value: bool) -> Self {
        Self(value as u64)
    }

    /// Wraps a guest address.
    pub const fn from_address(address: u64) -> Self {
        Self(address)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    /// Interprets the word as a guest address.
    pub const fn as_address(self) -> u64 {
        self.0
    }

    /// True when every bit is clear.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Little-endian bytes of the word.
    pub const fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Debug for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Word(0x{:016x})", self.0)
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Word {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_view_shares_bits_with_unsigned() {
        let w = Word::from_i64(-1);
        assert_eq!(w.as_u64(), u64::MAX);
        assert_eq!(w.as_i64(), -1);
    }

    #[test]
    fn float_view_is_bit_exact() {
        let w = Word::from_f64(-0.0);
        assert_eq!(w.as_u64(), 0x8000_0000_0000_0000);
        assert!(w.as_f64().is_sign_negative());
        assert!(!w.is_zero());
    }

    #[test]
    fn zero_is_zero_in_every_view() {
        assert!(Word::ZERO.is_zero());
        assert_eq!(Word::ZERO.as_f64(), 0.0);
        assert_eq!(Word::ZERO.as_address(), 0);
    }

    #[test]
    fn debug_prints_hex() {
        assert_eq!(format!("{:?}", Word::from_u64(255)), "Word(0x00000000000000ff)");
    }
}
