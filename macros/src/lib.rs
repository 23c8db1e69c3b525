//! Augment the testing of simulations with procedural macros.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, Error, ItemFn, LitStr};

/// Run a test with a `tracing` subscriber that writes to the test output.
///
/// The maximum level defaults to `DEBUG` and can be overridden with a string
/// literal (`TRACE`, `DEBUG`, `INFO`, `WARN` or `ERROR`). The subscriber is
/// installed for the current thread only, so tests can run in parallel.
///
/// # Example
///
/// ```rust,ignore
/// use lockstep_macros::test_traced;
///
/// #[test_traced("INFO")]
/// fn test_something() {
///     tracing::info!("visible");
///     tracing::debug!("hidden");
/// }
/// ```
#[proc_macro_attribute]
pub fn test_traced(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    // Resolve the requested level
    let level = if attr.is_empty() {
        "DEBUG".to_string()
    } else {
        parse_macro_input!(attr as LitStr).value()
    };
    let level = match level.to_ascii_uppercase().as_str() {
        "TRACE" => quote! { ::tracing::Level::TRACE },
        "DEBUG" => quote! { ::tracing::Level::DEBUG },
        "INFO" => quote! { ::tracing::Level::INFO },
        "WARN" => quote! { ::tracing::Level::WARN },
        "ERROR" => quote! { ::tracing::Level::ERROR },
        other => {
            return Error::new(Span::call_site(), format!("invalid log level: {other}"))
                .to_compile_error()
                .into();
        }
    };

    // Wrap the body with a scoped subscriber
    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let body = &input.block;
    let expanded = quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let subscriber = ::tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(#level)
                .with_line_number(true)
                .finish();
            let _guard = ::tracing::subscriber::set_default(subscriber);
            #body
        }
    };
    TokenStream::from(expanded)
}
