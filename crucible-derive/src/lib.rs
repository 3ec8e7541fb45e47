//! Procedural macros for the Crucible agent orchestration engine.
//!
//! - [`tool`] — attribute macro that turns a plain async function into a
//!   `crucible::tool::ToolHandler` plus a matching `ToolDefinition`, with the
//!   JSON input schema inferred from the function's argument types.

extern crate proc_macro;

use proc_macro::TokenStream;
use syn::{ItemFn, parse_macro_input};

mod tool;

/// Attribute macro that transforms a function into a `crucible::tool::ToolHandler`.
///
/// # Arguments
///
/// - `description` - Description of the tool surfaced to the model.
/// - `params(...)` - Per-parameter descriptions.
/// - `required(...)` - Which parameters are required.
///
/// # Example
///
/// ```rust,ignore
/// use crucible_derive::tool;
///
/// #[tool(description = "Add two integers")]
/// async fn add(a: i64, b: i64) -> Result<i64, crucible::tool::ToolError> {
///     Ok(a + b)
/// }
/// ```
#[proc_macro_attribute]
pub fn tool(args: TokenStream, input: TokenStream) -> TokenStream {
    let args = parse_macro_input!(args as tool::ToolMacroArgs);
    let input_fn = parse_macro_input!(input as ItemFn);

    tool::expand_tool(args, input_fn)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
