use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod params;

#[proc_macro_derive(Params, attributes(params, param))]
pub fn derive_params(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = params::derive_params(input);
    expanded.into()
}
