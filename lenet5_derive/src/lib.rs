//! # Derive Layer and implement Forward
//! [`Layer`](macro@Layer) can be derived for a struct composed of other layers.\
//! `#[impl_forward(Ix4, Ix2)]` generates a sequential implementation of
//! `Forward<Variable<Ix4>, Output = Variable<Ix2>>`.\
//! Use `#[layer(skip)]` to skip fields.
//!```
//! use lenet5::learn::neural_network::layer::{Conv2, Dense, Flatten, Rbf, ScaledTanh, Subsample2};
//! use lenet5_derive::{impl_forward, Layer};
//! use ndarray::{Ix2, Ix4};
//!
//! #[impl_forward(Ix4, Ix2)]
//! #[derive(Layer)]
//! struct Small {
//!     conv: Conv2<ScaledTanh>,
//!     pool: Subsample2<ScaledTanh>,
//!     flatten: Flatten,
//!     dense: Dense<ScaledTanh>,
//!     output: Rbf,
//!     #[layer(skip)]
//!     name: String,
//! }
//!```
//! Generates:
//!```ignore
//! impl Layer for Small {
//!     fn set_training(&mut self, training: bool) -> Result<()> {
//!         self.conv.set_training(training)?;
//!         self.pool.set_training(training)?;
//!         self.flatten.set_training(training)?;
//!         self.dense.set_training(training)?;
//!         self.output.set_training(training)?;
//!         Ok(())
//!     }
//!     fn parameters(&self) -> Vec<ParameterD> {
//!         let mut parameters = Vec::new();
//!         parameters.extend(self.conv.parameters());
//!         // ...
//!         parameters
//!     }
//!     fn parameters_mut(&mut self) -> Result<Vec<ParameterViewMutD>> {
//!         let mut parameters = Vec::new();
//!         parameters.extend(self.conv.parameters_mut()?);
//!         // ...
//!         Ok(parameters)
//!     }
//!     fn parameter_count(&self) -> usize {
//!         0 + self.conv.parameter_count() + self.pool.parameter_count() // ...
//!     }
//! }
//!
//! impl Forward<Variable<Ix4>> for Small {
//!     type Output = Variable<Ix2>;
//!     fn forward(&self, input: Variable<Ix4>) -> Result<Variable<Ix2>> {
//!         Ok(input
//!             .forward(&self.conv)?
//!             .forward(&self.pool)?
//!             .forward(&self.flatten)?
//!             .forward(&self.dense)?
//!             .forward(&self.output)?)
//!     }
//! }
//!```

use proc_macro::TokenStream as BaseTokenStream;
use proc_macro2::{Span, TokenStream};
use quote::quote;
use syn::{
    parse_macro_input, AttributeArgs, Attribute, Data, DeriveInput, Error, Fields, Ident, Index,
    ItemStruct, Member, Meta, NestedMeta, Path,
};

fn is_layer_skip(attributes: &[Attribute]) -> bool {
    attributes.iter().any(|attribute| {
        attribute.path.is_ident("layer")
            && attribute
                .parse_args::<Ident>()
                .map(|ident| ident == "skip")
                .unwrap_or(false)
    })
}

fn layer_members(fields: &Fields) -> Vec<Member> {
    fields
        .iter()
        .enumerate()
        .filter(|(_, field)| !is_layer_skip(&field.attrs))
        .map(|(i, field)| {
            if let Some(ident) = &field.ident {
                Member::Named(ident.clone())
            } else {
                Member::Unnamed(Index::from(i))
            }
        })
        .collect()
}

fn crate_path() -> TokenStream {
    quote! { ::lenet5 }
}

#[proc_macro_derive(Layer, attributes(layer))]
pub fn derive_layer(input: BaseTokenStream) -> BaseTokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let fields = match &input.data {
        Data::Struct(data_struct) => &data_struct.fields,
        _ => {
            return Error::new(Span::call_site(), "Layer can only be derived for structs!")
                .to_compile_error()
                .into()
        }
    };
    let lenet5 = crate_path();
    let members = layer_members(fields);
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let gen = quote! {
        impl #impl_generics #lenet5::learn::neural_network::layer::Layer for #ident #ty_generics #where_clause {
            fn set_training(&mut self, training: bool) -> #lenet5::result::Result<()> {
                #(
                    #lenet5::learn::neural_network::layer::Layer::set_training(&mut self.#members, training)?;
                )*
                ::std::result::Result::Ok(())
            }
            fn parameters(&self) -> ::std::vec::Vec<#lenet5::learn::neural_network::autograd::ParameterD> {
                #[allow(unused_mut)]
                let mut parameters = ::std::vec::Vec::new();
                #(
                    parameters.extend(#lenet5::learn::neural_network::layer::Layer::parameters(&self.#members));
                )*
                parameters
            }
            fn parameters_mut(
                &mut self,
            ) -> #lenet5::result::Result<::std::vec::Vec<#lenet5::learn::neural_network::autograd::ParameterViewMutD<'_>>> {
                #[allow(unused_mut)]
                let mut parameters = ::std::vec::Vec::new();
                #(
                    parameters.extend(#lenet5::learn::neural_network::layer::Layer::parameters_mut(&mut self.#members)?);
                )*
                ::std::result::Result::Ok(parameters)
            }
            fn parameter_count(&self) -> usize {
                0 #(
                    + #lenet5::learn::neural_network::layer::Layer::parameter_count(&self.#members)
                )*
            }
        }
    };
    BaseTokenStream::from(gen)
}

fn dim_path(nested: Option<&NestedMeta>) -> Option<&Path> {
    match nested? {
        NestedMeta::Meta(Meta::Path(path)) => Some(path),
        _ => None,
    }
}

#[proc_macro_attribute]
pub fn impl_forward(attr: BaseTokenStream, item: BaseTokenStream) -> BaseTokenStream {
    let mut output = item.clone();
    let nested = parse_macro_input!(attr as AttributeArgs);
    let (input_dim, output_dim) = match (dim_path(nested.first()), dim_path(nested.get(1))) {
        (Some(input_dim), Some(output_dim)) if nested.len() == 2 => (input_dim, output_dim),
        _ => {
            return Error::new(
                Span::call_site(),
                "expected #[impl_forward(InputDim, OutputDim)]",
            )
            .to_compile_error()
            .into()
        }
    };
    let input = parse_macro_input!(item as ItemStruct);
    let lenet5 = crate_path();
    let members = layer_members(&input.fields);
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let gen = if members.is_empty() {
        quote! {
            impl #impl_generics #lenet5::learn::neural_network::layer::Forward<#lenet5::learn::neural_network::autograd::Variable<#input_dim>> for #ident #ty_generics #where_clause {
                type Output = #lenet5::learn::neural_network::autograd::Variable<#output_dim>;
                fn forward(
                    &self,
                    input: #lenet5::learn::neural_network::autograd::Variable<#input_dim>,
                ) -> #lenet5::result::Result<Self::Output> {
                    ::std::result::Result::Ok(input.into_dimensionality()?)
                }
            }
        }
    } else {
        quote! {
            impl #impl_generics #lenet5::learn::neural_network::layer::Forward<#lenet5::learn::neural_network::autograd::Variable<#input_dim>> for #ident #ty_generics #where_clause {
                type Output = #lenet5::learn::neural_network::autograd::Variable<#output_dim>;
                fn forward(
                    &self,
                    input: #lenet5::learn::neural_network::autograd::Variable<#input_dim>,
                ) -> #lenet5::result::Result<Self::Output> {
                    ::std::result::Result::Ok(input #(.forward(&self.#members)?)*)
                }
            }
        }
    };
    output.extend(BaseTokenStream::from(gen));
    output
}
