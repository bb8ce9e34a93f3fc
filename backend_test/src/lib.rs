use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, spanned::Spanned, FnArg, Ident, ItemFn, Pat, Signature, Type};

/// Transform an asynchronous test into a synchronous one and inject
/// dependencies.
///
/// Injectable dependencies are [`rocket::local::asynchronous::Client`],
/// `crate::store::MemoryStore` and `crate::sms::testing::RecordingSender`.
/// The client's server is built over the injected store and sender, so a
/// test can seed data and inspect side effects through them.
///
/// `#[backend_test(voter)]` and `#[backend_test(authority)]` store the
/// example voter or paper authority before the test runs.
#[proc_macro_attribute]
pub fn backend_test(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item_fn = parse_macro_input!(input as ItemFn);

    // Extract type information and reject invalid function signatures.
    let test_args = match check_sig(item_fn.sig.clone()) {
        Ok(args) => args,
        Err(err) => {
            return err.into_compile_error().into();
        }
    };

    // Rename the future so the test can have its original name.
    let name = item_fn.sig.ident.clone();
    let new_name = format_ident!("{}_fut", name);
    item_fn.sig.ident = new_name.clone();

    // Store the account the test acts as, if needed.
    let maybe_account = match parse_macro_input!(args as Option<Ident>) {
        Some(arg) if arg == "voter" => quote! {
            store.insert_user(crate::model::user::User::example());
        },
        Some(arg) if arg == "authority" => quote! {
            store.insert_user(crate::model::user::User::authority_example());
        },
        Some(arg) => {
            return syn::Error::new(arg.span(), "Expected `voter` or `authority`")
                .into_compile_error()
                .into();
        }
        None => quote! {},
    };

    // Rewrite the test function.
    quote! {
        #[test]
        fn #name() {
            /// The test itself.
            #item_fn

            // This test enters the request handlers, so enable logging.
            log4rs_test_utils::test_logging::init_logging_once_for(
                ["vote_auth_backend", "vote", "paper_authority"],
                None,
                None,
            );

            let runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("rocket-worker-test-thread")
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let store = crate::store::MemoryStore::default();
                let sender = crate::sms::testing::RecordingSender::default();

                #maybe_account

                let rocket_client = rocket::local::asynchronous::Client::tracked(
                    crate::test_rocket(store.clone(), sender.clone()),
                )
                .await
                .unwrap();

                #new_name(#(#test_args),*).await;
            });
        }
    }
    .into()
}

/// Ensure the wrapped test is async, map each parameter to the value
/// injected for it, and reject unknown parameters.
fn check_sig(sig: Signature) -> Result<Vec<TokenStream2>, syn::Error> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "Test must be marked `async`"));
    }

    let mut has_client = false;
    let mut has_store = false;
    let mut has_sender = false;
    let mut args = vec![];

    for input in &sig.inputs {
        if let FnArg::Typed(pat_type) = input {
            if let (Pat::Ident(_), Type::Path(type_path)) = (&*pat_type.pat, &*pat_type.ty) {
                // Valid as the last path segment for any type is itself.
                let type_ident = &type_path.path.segments.last().unwrap().ident;
                let (seen, arg, full_name) = if type_ident == "Client" {
                    (
                        &mut has_client,
                        quote! { rocket_client },
                        "rocket::local::asynchronous::Client",
                    )
                } else if type_ident == "MemoryStore" {
                    (&mut has_store, quote! { store.clone() }, "MemoryStore")
                } else if type_ident == "RecordingSender" {
                    (&mut has_sender, quote! { sender.clone() }, "RecordingSender")
                } else {
                    return Err(unexpected(input));
                };
                if *seen {
                    return Err(syn::Error::new(
                        input.span(),
                        format!("Test cannot accept more than one `{full_name}`"),
                    ));
                }
                *seen = true;
                args.push(arg);
                continue;
            }
        }

        return Err(unexpected(input));
    }

    Ok(args)
}

fn unexpected(input: &FnArg) -> syn::Error {
    syn::Error::new(
        input.span(),
        "Expected one of `client: Client`, `store: MemoryStore` or `sender: RecordingSender`",
    )
}
