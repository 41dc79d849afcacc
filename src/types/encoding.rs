//! Binary encoding and decoding traits for the image format.
//!
//! Every multi-byte integer in an image is little-endian and fixed-width.
//! Unlike general purpose serializers there are no implicit length prefixes:
//! sections carry their counts in the header and variable-length fields
//! (operands, symbol names) spell out their own lengths, so those are read
//! with [`read_bytes`] by the loader rather than through a blanket impl.
//!
//! # Example
//!
//! ```ignore
//! use crate::types::encoding::{Encode, Decode};
//!
//! let value: u16 = 42;
//! let bytes = value.to_bytes();
//! let decoded = u16::from_bytes(&bytes).unwrap();
//! assert_eq!(value, decoded);
//! ```

use codefusion_derive::Error;

/// Sink for writing encoded bytes.
pub trait EncodeSink {
    /// Writes the given bytes to the sink.
    fn write(&mut self, bytes: &[u8]);
}

/// Counter for computing encoded size without allocating memory.
///
/// Used by `Encode::to_bytes` to pre-allocate exact capacity before encoding.
#[derive(Default)]
pub struct SizeCounter {
    len: usize,
}

impl SizeCounter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self { len: 0 }
    }

    /// Returns the total number of bytes counted.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing has been counted yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl EncodeSink for SizeCounter {
    fn write(&mut self, bytes: &[u8]) {
        self.len += bytes.len();
    }
}

impl EncodeSink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

impl EncodeSink for bytes::BytesMut {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Trait for types that can be serialized to binary format.
pub trait Encode {
    /// Writes the binary representation to the given sink.
    fn encode<S: EncodeSink>(&self, out: &mut S);

    /// Serializes to a new byte buffer with exact capacity.
    ///
    /// Performs two passes: first to count bytes, then to encode.
    fn to_bytes(&self) -> Vec<u8> {
        let mut counter = SizeCounter::new();
        self.encode(&mut counter);

        let mut out = Vec::with_capacity(counter.len());
        self.encode(&mut out);
        out
    }
}

/// Errors that can occur during decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Input ended before expected data was read.
    #[error("unexpected end of input: needed {needed} bytes, {available} available")]
    UnexpectedEof { needed: usize, available: usize },
    /// Data does not represent a valid value for the target type.
    #[error("invalid value")]
    InvalidValue,
    /// A count does not fit the host's address width.
    #[error("length {length} overflows the host address width")]
    LengthOverflow { length: u64 },
}

/// Trait for types that can be deserialized from binary format.
pub trait Decode: Sized {
    /// Reads and decodes a value from the input buffer.
    ///
    /// Advances the input slice past the consumed bytes.
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError>;

    /// Decodes a value from a byte slice, requiring all bytes to be consumed.
    ///
    /// Returns `InvalidValue` if trailing bytes remain after decoding.
    fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut input = data;
        let value = Self::decode(&mut input)?;

        if !input.is_empty() {
            return Err(DecodeError::InvalidValue);
        }

        Ok(value)
    }
}

/// Reads exactly `n` bytes from the input, advancing the slice.
pub fn read_bytes<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], DecodeError> {
    if input.len() < n {
        return Err(DecodeError::UnexpectedEof {
            needed: n,
            available: input.len(),
        });
    }
    let (bytes, rest) = input.split_at(n);
    *input = rest;
    Ok(bytes)
}

/// Converts an on-disk 64-bit count to a host `usize`.
pub fn to_usize(length: u64) -> Result<usize, DecodeError> {
    usize::try_from(length).map_err(|_| DecodeError::LengthOverflow { length })
}

impl Encode for u8 {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&[*self]);
    }
}

impl Decode for u8 {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let bytes = read_bytes(input, 1)?;
        Ok(bytes[0])
    }
}

// Fixed-size little-endian integers
macro_rules! impl_int {
    ($($t:ty),*) => {
        $(
            impl Encode for $t {
                fn encode<S: EncodeSink>(&self, out: &mut S) {
                    out.write(&self.to_le_bytes());
                }
            }

            impl Decode for $t {
                fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
                    const WIDTH: usize = std::mem::size_of::<$t>();
                    let mut raw = [0u8; WIDTH];
                    raw.copy_from_slice(read_bytes(input, WIDTH)?);
                    Ok(<$t>::from_le_bytes(raw))
                }
            }
        )*
    };
}

impl_int!(u16, u32, u64, i64);

impl<const N: usize> Encode for [u8; N] {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(self);
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let mut raw = [0u8; N];
        raw.copy_from_slice(read_bytes(input, N)?);
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_counter_accumulates() {
        let mut counter = SizeCounter::new();
        assert!(counter.is_empty());
        7u16.encode(&mut counter);
        9u64.encode(&mut counter);
        assert_eq!(counter.len(), 10);
    }

    #[test]
    fn to_bytes_writes_little_endian() {
        let bytes = 0x0102_0304u32.to_bytes();
        assert_eq!(bytes.len(), 4);
        assert_eq!(bytes, vec![0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn u16_little_endian() {
        assert_eq!(0xBEEFu16.to_bytes(), vec![0xEF, 0xBE]);
        assert_eq!(u16::from_bytes(&[0xEF, 0xBE]).unwrap(), 0xBEEF);
    }

    #[test]
    fn i64_negative_values() {
        let bytes = (-2i64).to_bytes();
        assert_eq!(bytes, vec![0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(i64::from_bytes(&bytes).unwrap(), -2);
    }

    #[test]
    fn array_has_no_length_prefix() {
        assert_eq!(b".CF".to_bytes(), b".CF".to_vec());
    }

    #[test]
    fn decode_reports_missing_bytes() {
        let mut input: &[u8] = &[1, 2, 3];
        assert_eq!(
            u64::decode(&mut input),
            Err(DecodeError::UnexpectedEof {
                needed: 8,
                available: 3
            })
        );
    }

    #[test]
    fn decode_advances_cursor() {
        let mut input: &[u8] = &[0x01, 0x02, 0x03];
        assert_eq!(u16::decode(&mut input).unwrap(), 0x0201);
        assert_eq!(input, &[0x03]);
    }

    #[test]
    fn from_bytes_rejects_trailing_bytes() {
        assert_eq!(u8::from_bytes(&[1, 2]), Err(DecodeError::InvalidValue));
    }
}
