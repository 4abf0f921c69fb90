//! Test attributes that fail a test instead of hanging it.
//!
//! `#[timeout]` wraps a synchronous test, `#[tokio_timeout_test]` an async
//! one. Both accept a bound in seconds (default 60). The async form also
//! takes `flavor = "multi_thread"` and `worker_threads = N`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::Parser, punctuated::Punctuated, Attribute, Expr, ExprLit, ItemFn, Lit, Token,
};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct Options {
    timeout_secs: u64,
    multi_thread: bool,
    worker_threads: Option<usize>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            multi_thread: false,
            worker_threads: None,
        }
    }
}

fn parse_options(attr: TokenStream, allow_runtime: bool) -> syn::Result<Options> {
    let mut options = Options::default();
    let args = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;

    for arg in args {
        match arg {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
                options.timeout_secs = secs;
            }
            Expr::Assign(assign) if allow_runtime => {
                let key = match assign.left.as_ref() {
                    Expr::Path(path) => path.path.get_ident().map(|ident| ident.to_string()),
                    _ => None,
                };
                match (key.as_deref(), assign.right.as_ref()) {
                    (
                        Some("flavor"),
                        Expr::Lit(ExprLit {
                            lit: Lit::Str(value),
                            ..
                        }),
                    ) => match value.value().as_str() {
                        "current_thread" => options.multi_thread = false,
                        "multi_thread" => options.multi_thread = true,
                        _ => {
                            return Err(syn::Error::new_spanned(
                                value,
                                "flavor must be \"current_thread\" or \"multi_thread\"",
                            ))
                        }
                    },
                    (
                        Some("worker_threads"),
                        Expr::Lit(ExprLit {
                            lit: Lit::Int(value),
                            ..
                        }),
                    ) => options.worker_threads = Some(value.base10_parse()?),
                    _ => {
                        return Err(syn::Error::new_spanned(
                            &assign,
                            "expected `flavor = \"...\"` or `worker_threads = N`",
                        ))
                    }
                }
            }
            other => {
                return Err(syn::Error::new_spanned(other, "unsupported test option"));
            }
        }
    }

    if options.worker_threads.is_some() && !options.multi_thread {
        return Err(syn::Error::new(
            proc_macro2::Span::call_site(),
            "worker_threads requires flavor = \"multi_thread\"",
        ));
    }
    Ok(options)
}

/// Runs `body` on a helper thread and panics if it outlives the bound.
fn guarded(timeout_secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#timeout_secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, true) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_path(attr, &["tokio", "test"]))
        .collect();

    let builder = if options.multi_thread {
        let workers = options
            .worker_threads
            .map(|n| quote! { .worker_threads(#n) });
        quote! { tokio::runtime::Builder::new_multi_thread() #workers }
    } else {
        quote! { tokio::runtime::Builder::new_current_thread() }
    };
    let timeout_secs = options.timeout_secs;
    let body = guarded(
        timeout_secs,
        quote! {{
            let runtime = #builder
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(timeout_duration, async move #block)
                    .await
                    .expect("test timed out");
            });
        }},
    );

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            #body
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, false) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_path(attr, &["test"]))
        .collect();
    let body = guarded(options.timeout_secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            #body
        }
    })
}

fn is_path(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments.len() == expected.len() && segments.iter().zip(expected).all(|(a, b)| a == b)
}
