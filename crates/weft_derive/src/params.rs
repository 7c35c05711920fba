use proc_macro2::TokenStream;
use quote::quote;
use syn::{DeriveInput, Fields, LitStr, Path, Type, spanned::Spanned};

/// Returns `true` if the type is spelled as `Option<...>`.
fn is_option(ty: &Type) -> bool {
    match ty {
        Type::Path(path) => path
            .path
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "Option"),
        _ => false,
    }
}

pub fn derive_params(input: DeriveInput) -> TokenStream {
    // retrieve struct field information
    let fields = match &input.data {
        syn::Data::Struct(data_struct) => &data_struct.fields,
        _ => {
            return syn::Error::new(input.span(), "`Params` can only be derived for structs")
                .to_compile_error();
        }
    };
    let fields = match fields {
        Fields::Named(fields_named) => &fields_named.named,
        Fields::Unit => {
            return syn::Error::new(input.span(), "unit structs have no parameters to parse")
                .to_compile_error();
        }
        Fields::Unnamed(fields_unnamed) => {
            return syn::Error::new(
                fields_unnamed.span(),
                "tuple structs are not supported by `Params` derive",
            )
            .to_compile_error();
        }
    };

    // parse container attributes
    let mut crate_name = None;
    for attr in &input.attrs {
        if !attr.path().is_ident("params") {
            continue;
        }

        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                crate_name = Some(s.parse::<Path>()?);
                Ok(())
            } else {
                Err(meta.error("unexpected attribute; supported is `crate`"))
            }
        });

        if let Err(err) = result {
            return err.to_compile_error();
        }
    }
    let base_path = match crate_name {
        Some(path) => quote!(#path::loom::params),
        None => quote!(::weft::loom::params),
    };

    let mut keys = Vec::with_capacity(fields.len());
    let mut inits = Vec::with_capacity(fields.len());

    for field in fields {
        let Some(ident) = &field.ident else {
            return syn::Error::new(field.span(), "expected a named field").to_compile_error();
        };

        // parse field attributes
        let mut key = ident.to_string();
        let mut default: Option<LitStr> = None;
        for attr in &field.attrs {
            if !attr.path().is_ident("param") {
                continue;
            }

            let result = attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("default") {
                    default = Some(meta.value()?.parse()?);
                    Ok(())
                } else if meta.path.is_ident("rename") {
                    let s: LitStr = meta.value()?.parse()?;
                    key = s.value();
                    Ok(())
                } else {
                    Err(meta.error("unexpected attribute; supported are `default` and `rename`"))
                }
            });

            if let Err(err) = result {
                return err.to_compile_error();
            }
        }

        let init = match (default, is_option(&field.ty)) {
            (Some(default), _) => quote! {
                #ident: #base_path::field(dict, #key, ::std::option::Option::Some(#default))?
            },
            (None, true) => quote! {
                #ident: #base_path::optional(dict, #key)?
            },
            (None, false) => quote! {
                #ident: #base_path::field(dict, #key, ::std::option::Option::None)?
            },
        };
        keys.push(key);
        inits.push(init);
    }

    let name = input.ident;
    let generics = &input.generics;
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    quote! {
        impl #impl_generics #base_path::Params for #name #ty_generics #where_clause {
            const FIELDS: &'static [&'static str] = &[#(#keys),*];

            fn from_dict(
                dict: &#base_path::ParamDict,
            ) -> ::std::result::Result<Self, #base_path::ParamError> {
                #base_path::check_keys(dict, Self::FIELDS)?;
                ::std::result::Result::Ok(Self {
                    #(#inits),*
                })
            }
        }
    }
}
