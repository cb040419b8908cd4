use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::meta::ParseNestedMeta;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt, LitStr};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_WORKERS: usize = 2;

#[derive(Clone, Copy)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct HarnessArgs {
    timeout_secs: u64,
    flavor: Flavor,
    workers: Option<usize>,
}

impl Default for HarnessArgs {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
            workers: None,
        }
    }
}

impl HarnessArgs {
    fn parse(&mut self, meta: ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("secs") {
            let lit: LitInt = meta.value()?.parse()?;
            let secs: u64 = lit.base10_parse()?;
            if secs == 0 {
                return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
            }
            self.timeout_secs = secs;
            Ok(())
        } else if meta.path.is_ident("flavor") {
            let lit: LitStr = meta.value()?.parse()?;
            self.flavor = match lit.value().as_str() {
                "current_thread" => Flavor::CurrentThread,
                "multi_thread" => Flavor::MultiThread,
                other => {
                    return Err(syn::Error::new_spanned(
                        &lit,
                        format!("unknown runtime flavor `{other}`"),
                    ));
                }
            };
            Ok(())
        } else if meta.path.is_ident("workers") {
            let lit: LitInt = meta.value()?.parse()?;
            let workers: usize = lit.base10_parse()?;
            if workers == 0 {
                return Err(syn::Error::new_spanned(lit, "workers must be greater than zero"));
            }
            self.workers = Some(workers);
            Ok(())
        } else {
            Err(meta.error("expected `secs`, `flavor` or `workers`"))
        }
    }

    fn runtime_builder(&self) -> TokenStream2 {
        match self.flavor {
            Flavor::CurrentThread => quote! { tokio::runtime::Builder::new_current_thread() },
            Flavor::MultiThread => {
                let workers = self.workers.unwrap_or(DEFAULT_WORKERS);
                quote! {
                    {
                        let mut builder = tokio::runtime::Builder::new_multi_thread();
                        builder.worker_threads(#workers);
                        builder
                    }
                }
            }
        }
    }
}

/// Runs an async test on a dedicated Tokio runtime and fails it once the
/// wall-clock budget is spent, even if the runtime itself is wedged.
///
/// ```ignore
/// #[test_timeout::tokio_timeout_test(secs = 5, flavor = "multi_thread", workers = 4)]
/// async fn converges() { /* ... */ }
/// ```
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut args = HarnessArgs::default();
    let parser = syn::meta::parser(|meta| args.parse(meta));
    parse_macro_input!(attr with parser);

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
    if args.workers.is_some() && matches!(args.flavor, Flavor::CurrentThread) {
        return syn::Error::new_spanned(
            &sig.ident,
            "`workers` requires flavor = \"multi_thread\"",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let passthrough: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_harness_attribute(attr))
        .collect();
    let timeout = args.timeout_secs;
    let builder = args.runtime_builder();

    TokenStream::from(quote! {
        #[test]
        #(#passthrough)*
        #vis #sig {
            let budget = std::time::Duration::from_secs(#timeout);
            let (report, outcome) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(budget, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = report.send(result);
            });
            match outcome.recv_timeout(budget + std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited before reporting a result")
                }
            }
        }
    })
}

/// `#[test]` and `#[tokio::test]` would register the function twice.
fn is_test_harness_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
