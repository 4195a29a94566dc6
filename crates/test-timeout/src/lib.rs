//! `#[tokio_timeout_test]`: async tests on a multi-threaded Tokio runtime
//! with a hard deadline, run on their own thread under a watchdog. Media-engine callbacks run on their own tasks, so a
//! current-thread runtime can starve them while the test body awaits.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_DEADLINE_SECS: u64 = 30;
const WORKER_THREADS: usize = 2;
/// Extra time the watchdog allows for runtime shutdown.
const GRACE_SECS: u64 = 2;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let deadline_secs = if attr.is_empty() {
        DEFAULT_DEADLINE_SECS
    } else {
        let lit = parse_macro_input!(attr as LitInt);
        match lit.base10_parse::<u64>() {
            Ok(0) => {
                return syn::Error::new_spanned(lit, "deadline must be at least one second")
                    .to_compile_error()
                    .into();
            }
            Ok(secs) => secs,
            Err(err) => return err.to_compile_error().into(),
        }
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test expects an async fn")
            .to_compile_error()
            .into();
    }

    let attrs: Vec<Attribute> = attrs.into_iter().filter(|a| !is_test_marker(a)).collect();
    let name = sig.ident.to_string();
    let workers = WORKER_THREADS;

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#deadline_secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = tokio::runtime::Builder::new_multi_thread()
                        .worker_threads(#workers)
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime");
                    let outcome = runtime.block_on(async move {
                        tokio::time::timeout(deadline, async move #block).await
                    });
                    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
                    outcome.is_ok()
                }));
                let _ = sender.send(result);
            });
            // A body that blocks its worker never lets the timer fire; the
            // watchdog still ends the test.
            let watchdog = deadline + std::time::Duration::from_secs(#GRACE_SECS);
            match receiver.recv_timeout(watchdog) {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => panic!("{} exceeded its {}s deadline", #name, #deadline_secs),
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!(
                    "{} exceeded its {}s deadline and stopped responding",
                    #name, #deadline_secs
                ),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} test thread exited without a result", #name)
                }
            }
        }
    })
}

/// `#[test]` and `#[tokio::test]` would double-register the function.
fn is_test_marker(attr: &Attribute) -> bool {
    let path = attr.path();
    path.is_ident("test")
        || (path.segments.len() == 2
            && path.segments[0].ident == "tokio"
            && path.segments[1].ident == "test")
}
