//! Derive macro for image section records.
//!
//! Generates `Encode` and `Decode` implementations for structs whose on-disk
//! layout is exactly their fields laid end to end.
//!
//! # Supported Types
//!
//! - **Named structs**: `struct PoolEntry { address: u64, size: u16 }`
//! - **Tuple structs**: `struct Flags(u8)`
//!
//! Enums and unions are rejected: image records never carry a discriminant.
//!
//! # Binary Format
//!
//! Fields are serialized in declaration order with no padding, no length
//! prefixes and no tags. Integers are little-endian and fixed-width.

use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, parse_macro_input};

/// Derives `Encode` and `Decode` for a struct.
///
/// # Example
///
/// ```ignore
/// use codefusion_derive::BinaryCodec;
///
/// #[derive(BinaryCodec)]
/// pub struct PoolEntry {
///     pub address: u64,
///     pub size: u16,
/// }
/// ```
///
/// expands to an `Encode` impl writing `address` then `size`, and a `Decode`
/// impl reading them back in the same order from the shared cursor.
pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let fields = match &input.data {
        Data::Struct(data_struct) => &data_struct.fields,
        Data::Enum(_) | Data::Union(_) => {
            return syn::Error::new_spanned(
                &input,
                "BinaryCodec derive supports structs only; image records have no discriminant",
            )
            .to_compile_error()
            .into();
        }
    };

    let (encode_body, decode_body) = match fields {
        Fields::Named(named) => {
            let idents: Vec<_> = named.named.iter().map(|f| &f.ident).collect();
            (
                quote! {
                    #( crate::types::encoding::Encode::encode(&self.#idents, out); )*
                },
                quote! {
                    Ok(Self {
                        #( #idents: crate::types::encoding::Decode::decode(input)?, )*
                    })
                },
            )
        }
        Fields::Unnamed(unnamed) => {
            let indices: Vec<_> = (0..unnamed.unnamed.len()).map(syn::Index::from).collect();
            let reads = indices.iter().map(|_| {
                quote! { crate::types::encoding::Decode::decode(input)?, }
            });
            (
                quote! {
                    #( crate::types::encoding::Encode::encode(&self.#indices, out); )*
                },
                quote! {
                    Ok(Self( #(#reads)* ))
                },
            )
        }
        Fields::Unit => (quote! {}, quote! { Ok(Self) }),
    };

    let expanded = quote! {
        impl #impl_generics crate::types::encoding::Encode for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                #encode_body
            }
        }

        impl #impl_generics crate::types::encoding::Decode for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn decode(input: &mut &[u8]) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                #decode_body
            }
        }
    };

    TokenStream::from(expanded)
}
