//! Core value types shared by the loader and the machine.
//!
//! - `encoding`: little-endian `Encode`/`Decode` traits used by the image codec
//! - `word`: the untagged 8-byte [`word::Word`]

pub mod encoding;
pub mod word;
