//! Derive macro for error enums.
//!
//! Generates `std::fmt::Display`, `std::error::Error` and `From` conversions.
//! Replacement for `thiserror` crate.
//!
//! # Usage
//!
//! ```ignore
//! use codefusion_derive::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum LoadError {
//!     #[error("bad magic {found:?}")]
//!     BadMagic { found: [u8; 3] },
//!
//!     #[error("decode failed: {0}")]
//!     Decode(#[from] DecodeError),
//!
//!     #[error("trailing bytes")]
//!     TrailingBytes,
//! }
//! ```
//!
//! # Supported Features
//!
//! - Unit variants: `#[error("message")]`
//! - Tuple variants with positional args: `#[error("error: {0}")]`
//! - Struct variants with named args: `#[error("expected {expected}")]`
//! - `#[from]` on the only field of a variant: emits `From<Field>` and wires
//!   `Error::source` to that field
//!
//! Fields not mentioned in the message are simply not formatted.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, Lit, Meta, parse_macro_input};

pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand_error_derive(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_error_derive(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let Data::Enum(data_enum) = &input.data else {
        return Err(syn::Error::new_spanned(
            input,
            "Error derive supports enums only",
        ));
    };

    let mut display_arms = Vec::new();
    let mut source_arms = Vec::new();
    let mut from_impls = Vec::new();

    for variant in &data_enum.variants {
        let variant_name = &variant.ident;
        let message = extract_error_message(&variant.attrs, variant)?;

        match &variant.fields {
            Fields::Unit => {
                display_arms.push(quote! {
                    Self::#variant_name => write!(f, #message),
                });
            }
            Fields::Unnamed(fields) => {
                let count = fields.unnamed.len();
                let message = convert_positional_to_named(&message, count);
                let bindings: Vec<_> = (0..count)
                    .map(|i| {
                        let ident = format_ident!("f{}", i);
                        if mentions(&message, &ident.to_string()) {
                            quote! { #ident }
                        } else {
                            quote! { _ }
                        }
                    })
                    .collect();
                let args: Vec<_> = (0..count)
                    .map(|i| format_ident!("f{}", i))
                    .filter(|ident| mentions(&message, &ident.to_string()))
                    .collect();
                display_arms.push(quote! {
                    Self::#variant_name(#(#bindings),*) => write!(f, #message #(, #args = #args)*),
                });

                let from_field = fields
                    .unnamed
                    .iter()
                    .find(|field| field.attrs.iter().any(|a| a.path().is_ident("from")));
                if let Some(field) = from_field {
                    if count != 1 {
                        return Err(syn::Error::new_spanned(
                            variant,
                            "#[from] requires the variant to have exactly one field",
                        ));
                    }
                    let ty = &field.ty;
                    from_impls.push(quote! {
                        impl #impl_generics ::std::convert::From<#ty> for #name #ty_generics #where_clause {
                            fn from(value: #ty) -> Self {
                                Self::#variant_name(value)
                            }
                        }
                    });
                    source_arms.push(quote! {
                        Self::#variant_name(inner) => Some(inner as &(dyn ::std::error::Error + 'static)),
                    });
                }
            }
            Fields::Named(fields) => {
                let used: Vec<_> = fields
                    .named
                    .iter()
                    .filter_map(|field| field.ident.as_ref())
                    .filter(|ident| mentions(&message, &ident.to_string()))
                    .collect();
                display_arms.push(quote! {
                    Self::#variant_name { #(#used,)* .. } => write!(f, #message #(, #used = #used)*),
                });
            }
        }
    }

    Ok(quote! {
        impl #impl_generics ::std::fmt::Display for #name #ty_generics #where_clause {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                match self {
                    #(#display_arms)*
                }
            }
        }

        impl #impl_generics ::std::error::Error for #name #ty_generics #where_clause {
            #[allow(unreachable_patterns)]
            fn source(&self) -> ::std::option::Option<&(dyn ::std::error::Error + 'static)> {
                match self {
                    #(#source_arms)*
                    _ => None,
                }
            }
        }

        #(#from_impls)*
    })
}

/// Returns true if `message` interpolates `ident` (`{ident}` or `{ident:..}`).
fn mentions(message: &str, ident: &str) -> bool {
    message.contains(&format!("{{{ident}}}")) || message.contains(&format!("{{{ident}:"))
}

/// Extracts the message from a variant's `#[error("...")]` attribute.
fn extract_error_message(attrs: &[syn::Attribute], variant: &syn::Variant) -> syn::Result<String> {
    for attr in attrs {
        if !attr.path().is_ident("error") {
            continue;
        }
        let Meta::List(meta_list) = &attr.meta else {
            return Err(syn::Error::new_spanned(
                &attr.meta,
                "invalid #[error] attribute; use #[error(\"message\")] to describe the error",
            ));
        };
        return match syn::parse2::<Lit>(meta_list.tokens.clone()) {
            Ok(Lit::Str(lit_str)) => Ok(lit_str.value()),
            _ => Err(syn::Error::new_spanned(
                &attr.meta,
                "#[error] message must be a string literal, e.g. #[error(\"illegal opcode {opcode}\")]",
            )),
        };
    }

    Err(syn::Error::new_spanned(
        variant,
        format!(
            "missing #[error(\"...\")] attribute on variant `{}`",
            variant.ident
        ),
    ))
}

/// Converts positional format args `{0}`, `{1:?}` to named args `{f0}`, `{f1:?}`.
fn convert_positional_to_named(format_str: &str, field_count: usize) -> String {
    let mut result = format_str.to_string();
    for i in (0..field_count).rev() {
        result = result
            .replace(&format!("{{{i}}}"), &format!("{{f{i}}}"))
            .replace(&format!("{{{i}:"), &format!("{{f{i}:"));
    }
    result
}
