//! `#[timeout]` and `#[tokio_timeout_test]` run the test body on a worker
//! thread and fail the test if it has not finished within the limit
//! (default 30 seconds, or the integer passed to the attribute).

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, Block, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    expand(attr, function, Flavor::Sync).into()
}

/// Like `#[tokio::test]` on a current-thread runtime with timers enabled.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    expand(attr, function, Flavor::Tokio).into()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Sync,
    Tokio,
}

fn expand(attr: TokenStream, function: ItemFn, flavor: Flavor) -> TokenStream2 {
    let limit = match parse_limit(attr) {
        Ok(limit) => limit,
        Err(err) => return err.to_compile_error(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = function;

    match (flavor, sig.asyncness.is_some()) {
        (Flavor::Sync, true) => {
            return syn::Error::new_spanned(&sig.ident, "use tokio_timeout_test for async tests")
                .to_compile_error();
        }
        (Flavor::Tokio, false) => {
            return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test needs an async fn")
                .to_compile_error();
        }
        _ => {}
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs.into_iter().filter(|a| !is_test_marker(a)).collect();
    let body = worker_body(&block, flavor);

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = ::std::time::Duration::from_secs(#limit);
            let (report, outcome) = ::std::sync::mpsc::channel();
            ::std::thread::spawn(move || {
                let result = ::std::panic::catch_unwind(
                    ::std::panic::AssertUnwindSafe(move || { #body })
                );
                let _ = report.send(result);
            });
            match outcome.recv_timeout(limit) {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => ::std::panic::resume_unwind(panic),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s", #limit)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test worker exited without reporting")
                }
            }
        }
    }
}

fn worker_body(block: &Block, flavor: Flavor) -> TokenStream2 {
    match flavor {
        Flavor::Sync => quote! { let _: () = #block; },
        Flavor::Tokio => quote! {
            let runtime = ::tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("build test runtime");
            runtime.block_on(async move { let _: () = async move #block .await; });
        },
    }
}

fn parse_limit(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let literal: LitInt = syn::parse(attr)?;
    let secs: u64 = literal.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(literal, "timeout must be at least one second"));
    }
    Ok(secs)
}

/// Drops `#[test]` and `#[tokio::test]` so the expansion does not register
/// the function twice.
fn is_test_marker(attr: &Attribute) -> bool {
    let path: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(path.as_slice(), [only] if only == "test")
        || matches!(path.as_slice(), [first, second] if first == "tokio" && second == "test")
}
