//! Implementation of the `#[tool]` attribute macro.
//!
//! Transforms a plain function into a `crucible::tool::ToolHandler`
//! implementation plus a matching `ToolDefinition`, with the JSON schema of
//! the input inferred from the function's argument types.

use convert_case::{Case, Casing};
use proc_macro2::TokenStream;
use quote::{format_ident, quote, quote_spanned};
use std::collections::HashMap;
use syn::{
    Expr, ExprLit, FnArg, Ident, ItemFn, Lit, Meta, Pat, PathArguments, ReturnType, Token, Type,
    parse::{Parse, ParseStream},
    punctuated::Punctuated,
};

/// Parsed arguments from the `#[tool(...)]` attribute.
#[derive(Default)]
pub(crate) struct ToolMacroArgs {
    pub description: Option<String>,
    pub param_descriptions: HashMap<String, String>,
    pub required: Vec<String>,
}

impl Parse for ToolMacroArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut result = Self::default();

        if input.is_empty() {
            return Ok(result);
        }

        let meta_list: Punctuated<Meta, Token![,]> = Punctuated::parse_terminated(input)?;

        for meta in meta_list {
            result.parse_meta_item(meta)?;
        }

        Ok(result)
    }
}

impl ToolMacroArgs {
    /// Parse a single meta item from the attribute arguments.
    fn parse_meta_item(&mut self, meta: Meta) -> syn::Result<()> {
        match meta {
            Meta::NameValue(nv) => {
                let ident = nv
                    .path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&nv.path, "expected identifier"))?;

                if ident == "description" {
                    self.description = Some(extract_string_lit(&nv.value)?);
                }
                // Silently ignore unknown name-value pairs for forward compatibility
            }
            Meta::List(list) if list.path.is_ident("params") => {
                self.parse_params_list(&list)?;
            }
            Meta::List(list) if list.path.is_ident("required") => {
                self.parse_required_list(&list)?;
            }
            _ => {
                // Silently ignore unknown meta items for forward compatibility
            }
        }
        Ok(())
    }

    /// Parse the `params(...)` nested list.
    fn parse_params_list(&mut self, list: &syn::MetaList) -> syn::Result<()> {
        let nested: Punctuated<Meta, Token![,]> =
            list.parse_args_with(Punctuated::parse_terminated)?;

        for meta in nested {
            if let Meta::NameValue(nv) = meta {
                let param_name = nv
                    .path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&nv.path, "expected parameter name"))?
                    .to_string();
                let description = extract_string_lit(&nv.value)?;
                self.param_descriptions.insert(param_name, description);
            }
        }
        Ok(())
    }

    /// Parse the `required(...)` nested list.
    fn parse_required_list(&mut self, list: &syn::MetaList) -> syn::Result<()> {
        let idents: Punctuated<Ident, Token![,]> =
            list.parse_args_with(Punctuated::parse_terminated)?;

        self.required = idents.into_iter().map(|id| id.to_string()).collect();
        Ok(())
    }
}

/// Extract a string literal from an expression.
fn extract_string_lit(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(lit_str),
            ..
        }) => Ok(lit_str.value()),
        _ => Err(syn::Error::new_spanned(expr, "expected string literal")),
    }
}

/// Extract the success type `T` from a `Result<T, E>` return type.
fn extract_ok_type(return_type: &ReturnType) -> syn::Result<TokenStream> {
    let ReturnType::Type(_, ty) = return_type else {
        return Err(syn::Error::new_spanned(
            return_type,
            "function must have a return type of `Result<T, E>`",
        ));
    };

    let Type::Path(type_path) = ty.as_ref() else {
        return Err(syn::Error::new_spanned(
            ty,
            "return type must be a path type (e.g., `Result<T, E>`)",
        ));
    };

    let last_segment = type_path
        .path
        .segments
        .last()
        .ok_or_else(|| syn::Error::new_spanned(&type_path.path, "invalid return type path"))?;

    if last_segment.ident != "Result" {
        return Err(syn::Error::new_spanned(
            &last_segment.ident,
            "return type must be `Result<T, E>`",
        ));
    }

    let PathArguments::AngleBracketed(args) = &last_segment.arguments else {
        return Err(syn::Error::new_spanned(
            &last_segment.arguments,
            "expected angle bracketed type parameters for Result",
        ));
    };

    let output = args
        .args
        .first()
        .ok_or_else(|| syn::Error::new_spanned(args, "Result must name a success type"))?;

    Ok(quote!(#output))
}

/// Information about a single function parameter.
struct ParamInfo<'a> {
    name: &'a Ident,
    ty: &'a Type,
    description: String,
    json_type: TokenStream,
}

/// Extract parameter information from function arguments.
fn extract_params<'a>(
    inputs: impl Iterator<Item = &'a FnArg>,
    param_descriptions: &HashMap<String, String>,
) -> Vec<ParamInfo<'a>> {
    inputs
        .filter_map(|arg| {
            let FnArg::Typed(pat_type) = arg else {
                return None;
            };
            let Pat::Ident(param_ident) = pat_type.pat.as_ref() else {
                return None;
            };

            let name = &param_ident.ident;
            let name_str = name.to_string();
            let ty = pat_type.ty.as_ref();
            let description = param_descriptions
                .get(&name_str)
                .cloned()
                .unwrap_or_else(|| format!("Parameter {name_str}"));
            let json_type = rust_type_to_json_schema(ty);

            Some(ParamInfo {
                name,
                ty,
                description,
                json_type,
            })
        })
        .collect()
}

/// Convert a Rust type to a JSON schema type representation.
fn rust_type_to_json_schema(ty: &Type) -> TokenStream {
    let Type::Path(type_path) = ty else {
        return quote! { "type": "object" };
    };

    let Some(segment) = type_path.path.segments.first() else {
        return quote! { "type": "object" };
    };

    let type_name = segment.ident.to_string();

    if type_name == "Vec" {
        if let PathArguments::AngleBracketed(args) = &segment.arguments {
            if let Some(syn::GenericArgument::Type(inner_type)) = args.args.first() {
                let inner_json_type = rust_type_to_json_schema(inner_type);
                return quote! {
                    "type": "array",
                    "items": { #inner_json_type }
                };
            }
        }
        return quote! { "type": "array" };
    }

    if type_name == "Option" {
        if let PathArguments::AngleBracketed(args) = &segment.arguments {
            if let Some(syn::GenericArgument::Type(inner_type)) = args.args.first() {
                return rust_type_to_json_schema(inner_type);
            }
        }
        return quote! { "type": "object" };
    }

    match type_name.as_str() {
        "i8" | "i16" | "i32" | "i64" | "i128" | "isize" | "u8" | "u16" | "u32" | "u64" | "u128"
        | "usize" => quote! { "type": "integer" },
        "f32" | "f64" => quote! { "type": "number" },
        "String" | "str" | "Cow" => quote! { "type": "string" },
        "bool" => quote! { "type": "boolean" },
        _ => quote! { "type": "object" },
    }
}

/// Main entry point for the `#[tool]` macro expansion.
pub(crate) fn expand_tool(args: ToolMacroArgs, input_fn: ItemFn) -> syn::Result<TokenStream> {
    let fn_name = &input_fn.sig.ident;
    let fn_name_str = fn_name.to_string();
    let fn_span = input_fn.sig.ident.span();
    let is_async = input_fn.sig.asyncness.is_some();

    let ok_type = extract_ok_type(&input_fn.sig.output)?;

    let struct_name = format_ident!("{}", fn_name_str.to_case(Case::Pascal));
    let params_struct_name = format_ident!("{}Args", struct_name);

    let params = extract_params(input_fn.sig.inputs.iter(), &args.param_descriptions);
    let param_names: Vec<_> = params.iter().map(|p| p.name).collect();
    let param_types: Vec<_> = params.iter().map(|p| p.ty).collect();
    let param_descriptions: Vec<_> = params.iter().map(|p| &p.description).collect();
    let json_types: Vec<_> = params.iter().map(|p| &p.json_type).collect();

    let tool_description = match args.description {
        Some(desc) => quote! { #desc },
        None => quote! { concat!("Function tool ", #fn_name_str) },
    };

    let required_args = &args.required;

    let call_body = if is_async {
        quote! { #fn_name(#(parsed.#param_names,)*).await }
    } else {
        quote! { #fn_name(#(parsed.#param_names,)*) }
    };

    let expanded = quote_spanned! {fn_span=>
        #[derive(::serde::Deserialize)]
        struct #params_struct_name {
            #(#param_names: #param_types,)*
        }

        #input_fn

        /// Generated tool handler for
        #[doc = #fn_name_str]
        #[derive(Debug, Default, Clone, Copy)]
        pub struct #struct_name;

        impl #struct_name {
            /// Name this tool is registered under.
            pub const NAME: &'static str = #fn_name_str;

            /// Build the `ToolDefinition` for this generated handler.
            #[must_use]
            pub fn definition() -> ::crucible::tool::ToolDefinition {
                let schema = ::serde_json::json!({
                    "type": "object",
                    "properties": {
                        #(
                            stringify!(#param_names): {
                                #json_types,
                                "description": #param_descriptions
                            }
                        ),*
                    },
                    "required": [#(#required_args),*]
                });

                ::crucible::tool::ToolDefinition::new(#fn_name_str, #tool_description, schema)
                    .with_handler(::std::sync::Arc::new(#struct_name))
            }
        }

        #[::async_trait::async_trait]
        impl ::crucible::tool::ToolHandler for #struct_name {
            async fn call(
                &self,
                args: ::serde_json::Value,
                _ctx: &::crucible::tool::ToolContext,
            ) -> ::core::result::Result<::crucible::tool::ToolResult, ::crucible::tool::ToolError> {
                let parsed: #params_struct_name = ::serde_json::from_value(args)
                    .map_err(|e| ::crucible::tool::ToolError::InvalidArguments(e.to_string()))?;

                let output: #ok_type = #call_body
                    .map_err(|e| ::crucible::tool::ToolError::ExecutionError(e.to_string()))?;

                let value = ::serde_json::to_string(&output)
                    .map_err(|e| ::crucible::tool::ToolError::ExecutionError(e.to_string()))?;

                Ok(::crucible::tool::ToolResult::ok(value))
            }
        }
    };

    Ok(expanded)
}
