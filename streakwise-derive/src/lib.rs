//! A derive macro for the `Event` trait in the `streakwise` crate.
use proc_macro::TokenStream;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, LitInt, LitStr, parse_macro_input};

const DEFAULT_VERSION: u16 = 1;
const DEFAULT_SOURCE: &str = "urn:streakwise:event";

/// Settings collected from `#[event(...)]` attributes.
#[derive(Clone)]
struct EventAttrs {
    version: u16,
    source: String,
}

impl EventAttrs {
    fn parse(attrs: &[Attribute], mut base: EventAttrs) -> syn::Result<EventAttrs> {
        for attr in attrs.iter().filter(|a| a.path().is_ident("event")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("version") {
                    let lit: LitInt = meta.value()?.parse()?;
                    base.version = lit.base10_parse()?;
                    Ok(())
                } else if meta.path.is_ident("source") {
                    let lit: LitStr = meta.value()?.parse()?;
                    base.source = lit.value();
                    Ok(())
                } else {
                    Err(meta.error("expected `version` or `source`"))
                }
            })?;
        }
        Ok(base)
    }
}

/// Derives the `Event` trait for an enum.
///
/// `event_type` returns the variant name. `event_version` and `event_source`
/// default to `1` and `"urn:streakwise:event"` and can be set for the whole
/// enum or a single variant with `#[event(version = 2, source = "urn:...")]`.
#[proc_macro_derive(Event, attributes(event))]
pub fn event_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;

    let variants = match &input.data {
        Data::Enum(data) => &data.variants,
        _ => {
            return Err(syn::Error::new_spanned(
                name,
                "Event derive macro can only be used on enums",
            ));
        }
    };

    let defaults = EventAttrs::parse(
        &input.attrs,
        EventAttrs {
            version: DEFAULT_VERSION,
            source: DEFAULT_SOURCE.to_owned(),
        },
    )?;

    let mut type_arms = Vec::new();
    let mut version_arms = Vec::new();
    let mut source_arms = Vec::new();

    for variant in variants {
        let variant_name = &variant.ident;
        let fields = match &variant.fields {
            Fields::Named(_) => quote! { { .. } },
            Fields::Unnamed(_) => quote! { (..) },
            Fields::Unit => quote! {},
        };
        let attrs = EventAttrs::parse(&variant.attrs, defaults.clone())?;
        let version = attrs.version;
        let source = attrs.source;

        type_arms.push(quote! { #name::#variant_name #fields => stringify!(#variant_name) });
        version_arms.push(quote! { #name::#variant_name #fields => #version });
        source_arms.push(quote! { #name::#variant_name #fields => #source });
    }

    // Matching on a reference to an uninhabited enum is not exhaustive.
    let scrutinee = if variants.is_empty() {
        quote! { *self }
    } else {
        quote! { self }
    };
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics streakwise::Event for #name #ty_generics #where_clause {
            fn event_type(&self) -> &'static str {
                match #scrutinee {
                    #(#type_arms),*
                }
            }

            fn event_version(&self) -> u16 {
                match #scrutinee {
                    #(#version_arms),*
                }
            }

            fn event_source(&self) -> &'static str {
                match #scrutinee {
                    #(#source_arms),*
                }
            }
        }
    })
}
