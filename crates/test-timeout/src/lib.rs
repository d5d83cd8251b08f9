use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{Attribute, Block, Ident, ItemFn, LitInt, Token, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Arguments accepted by both attributes: an optional timeout in seconds and,
/// for async tests only, the `paused` flag.
struct TimeoutArgs {
    secs: u64,
    paused: Option<Ident>,
}

enum TimeoutArg {
    Secs(LitInt),
    Flag(Ident),
}

impl Parse for TimeoutArg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            input.parse().map(TimeoutArg::Secs)
        } else {
            input.parse().map(TimeoutArg::Flag)
        }
    }
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            paused: None,
        };
        let items = Punctuated::<TimeoutArg, Token![,]>::parse_terminated(input)?;
        for item in items {
            match item {
                TimeoutArg::Secs(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(
                            lit,
                            "timeout must be greater than zero",
                        ));
                    }
                    args.secs = secs;
                }
                TimeoutArg::Flag(ident) if ident == "paused" => args.paused = Some(ident),
                TimeoutArg::Flag(ident) => {
                    let message = format!("unknown test-timeout option `{ident}`");
                    return Err(syn::Error::new_spanned(ident, message));
                }
            }
        }
        Ok(args)
    }
}

/// Runs an async test on a fresh current-thread runtime behind a wall-clock
/// watchdog. `#[tokio_timeout_test(paused)]` starts the Tokio clock paused so
/// timer-driven code (deadlines, sweeps, reconnect loops) advances instantly.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = args.secs;
    // With a paused clock an in-runtime timeout would be auto-advanced past,
    // so only the wall-clock watchdog guards paused tests.
    let (builder, body) = if args.paused.is_some() {
        (
            quote! {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .start_paused(true)
                    .build()
            },
            quote! { runtime.block_on(async move #block); },
        )
    } else {
        (
            quote! {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
            },
            quote! {
                runtime.block_on(async {
                    tokio::time::timeout(timeout_duration, async move #block)
                        .await
                        .expect("test timed out");
                });
            },
        )
    };

    let run = quote! {
        let runtime = #builder.expect("failed to build Tokio runtime");
        #body
    };
    let watchdog = watchdog(timeout, run);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #watchdog
        }
    })
}

/// Runs a synchronous test on its own thread and fails it once the timeout
/// elapses.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    if let Some(flag) = args.paused {
        return syn::Error::new_spanned(flag, "`paused` only applies to tokio_timeout_test")
            .to_compile_error()
            .into();
    }

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let run = sync_body(&block);
    let watchdog = watchdog(args.secs, run);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #watchdog
        }
    })
}

fn sync_body(block: &Block) -> TokenStream2 {
    quote! { (|| #block)(); }
}

fn watchdog(timeout_secs: u64, run: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#timeout_secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                #run
            }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(())) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test timed out after {:?}", timeout_duration)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
