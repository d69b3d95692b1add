use proc_macro::{self, TokenStream};
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

/// Implements `labforge_library::types::ToAny` so trait objects can be cast back to the concrete type.
#[proc_macro_derive(ToAny)]
pub fn derive(input: TokenStream) -> TokenStream {
    let DeriveInput { ident, generics, .. } = parse_macro_input!(input);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let output = quote! {
        impl #impl_generics labforge_library::types::ToAny for #ident #ty_generics #where_clause {
            #[inline(always)]
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }
    };
    output.into()
}
