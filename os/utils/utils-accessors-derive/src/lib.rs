//! # Accessor Derive
//!
//! Derive macro for plain configuration structs: one `const` getter and one
//! `const` builder per named field, so configurations can be assembled in
//! `const` context and read without exposing the fields.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Attribute, Data, DeriveInput, Fields, LitBool, parse_macro_input, spanned::Spanned};

/// Derive `const fn <field>(&self) -> Ty` and
/// `const fn with_<field>(mut self, value: Ty) -> Self` for each **named**
/// field. Field types must be `Copy`.
///
/// Doc comments on a field are carried over to its getter.
///
/// - Skipping a field: `#[accessors(skip)]`
/// - Getter only: `#[accessors(get_only)]`
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Accessors;
///
/// #[derive(Accessors, Default)]
/// struct Limits {
///     /// Largest frame count.
///     frames: u32,
///     #[accessors(get_only)]
///     revision: u8,
///     #[accessors(skip)]
///     scratch: u64,
/// }
///
/// const L: Limits = Limits { frames: 0, revision: 2, scratch: 0 }.with_frames(64);
/// assert_eq!(L.frames(), 64);
/// assert_eq!(L.revision(), 2);
/// ```
#[proc_macro_derive(Accessors, attributes(accessors))]
pub fn derive_accessors(input: TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        generics,
        data,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let fields = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            Fields::Unnamed(u) => {
                return syn::Error::new(u.span(), "Accessors only supports named fields")
                    .to_compile_error()
                    .into();
            }
            Fields::Unit => {
                return syn::Error::new(ident.span(), "Accessors does not apply to unit structs")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new(ident.span(), "Accessors can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut methods = Vec::new();

    for field in fields {
        let Some(fname) = &field.ident else { continue };
        let mode = match field_mode(&field.attrs) {
            Ok(mode) => mode,
            Err(e) => return e.to_compile_error().into(),
        };
        if mode == Mode::Skip {
            continue;
        }

        let ty = &field.ty;
        let docs = field.attrs.iter().filter(|a| a.path().is_ident("doc"));
        methods.push(quote! {
            #(#docs)*
            #[inline]
            #[must_use]
            pub const fn #fname(&self) -> #ty {
                self.#fname
            }
        });

        if mode == Mode::Both {
            let with_name = format_ident!("with_{}", fname);
            let doc = format!("Builder: replace `{fname}`.");
            methods.push(quote! {
                #[doc = #doc]
                #[inline]
                #[must_use]
                pub const fn #with_name(mut self, value: #ty) -> Self {
                    self.#fname = value;
                    self
                }
            });
        }
    }

    let expanded = quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    };

    TokenStream::from(expanded)
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Mode {
    Both,
    GetOnly,
    Skip,
}

/// Accepts `#[accessors(skip)]`, `#[accessors(skip = true)]` and
/// `#[accessors(get_only)]`.
fn field_mode(attrs: &[Attribute]) -> syn::Result<Mode> {
    let mut mode = Mode::Both;
    for attr in attrs {
        if !attr.path().is_ident("accessors") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                let skip = if meta.input.is_empty() {
                    true
                } else {
                    meta.value()?.parse::<LitBool>()?.value
                };
                if skip {
                    mode = Mode::Skip;
                }
                Ok(())
            } else if meta.path.is_ident("get_only") {
                if mode != Mode::Skip {
                    mode = Mode::GetOnly;
                }
                Ok(())
            } else {
                Err(meta.error("expected `skip` or `get_only`"))
            }
        })?;
    }
    Ok(mode)
}
