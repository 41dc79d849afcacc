//! Derive macros for the codefusion crate.
//!
//! Provides:
//! - `#[derive(BinaryCodec)]` - fixed-layout little-endian image encoding
//! - `#[derive(Error)]` - error type boilerplate (thiserror replacement)

mod binary_codec;
mod error;

use proc_macro::TokenStream;

/// Implements `Encode` and `Decode` by visiting fields in declaration order.
#[proc_macro_derive(BinaryCodec)]
pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    binary_codec::derive_binary_codec(input)
}

/// Implements `Display`, `Error` and any `#[from]` conversions for error enums.
#[proc_macro_derive(Error, attributes(error, from))]
pub fn derive_error(input: TokenStream) -> TokenStream {
    error::derive_error(input)
}
