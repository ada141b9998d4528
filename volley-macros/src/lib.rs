use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::quote;
use syn::{punctuated::Punctuated, Ident, ItemFn};

/// Proc macro to denote a Transaction
///
/// Wraps an async function returning `Result<T, E>` so every call records a
/// `transaction_duration` sample and a `transaction_failed` sample, both tagged with
/// `transaction:<fn name>`.
///
/// # Example
/// ```ignore
/// use volley::prelude::*;
///
/// #[transaction]
/// async fn login(ctx: &VuContext, user: &str) -> Result<String, MyError> {
///     ...
/// }
/// ```
#[proc_macro_attribute]
pub fn transaction(attr: TokenStream, item: TokenStream) -> TokenStream {
    transaction_internal(attr.into(), item.into())
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn transaction_internal(_attr: TokenStream2, item: TokenStream2) -> syn::Result<TokenStream2> {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = syn::parse2::<ItemFn>(item)?;

    if sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            sig.fn_token,
            "#[transaction] only works on async functions",
        ));
    }

    let name = &sig.ident;
    let stmts = &block.stmts;
    Ok(quote! {
        #(#attrs)* #vis #sig {
            ::volley::transaction::transaction_hook(stringify!(#name), async move {
                #(#stmts)*
            }).await
        }
    })
}

/// Proc macro to denote a Scenario
///
/// The function is run once per iteration by every virtual user. It may take a single
/// `VuContext` argument, or none at all, and must not return a value.
///
/// The annotated name becomes a constructor for a `Scenario`, which is configured through the
/// `ConfigurableScenario` methods and then awaited to run it.
///
/// # Example
/// ```ignore
/// use volley::prelude::*;
///
/// #[scenario]
/// async fn my_scenario(ctx: VuContext) {
///     ctx.http().get("http://localhost:8080/").await;
/// }
/// ```
#[proc_macro_attribute]
pub fn scenario(attr: TokenStream, item: TokenStream) -> TokenStream {
    scenario_internal(attr.into(), item.into())
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn scenario_internal(_attr: TokenStream2, item: TokenStream2) -> syn::Result<TokenStream2> {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = syn::parse2::<ItemFn>(item)?;

    if sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            sig.fn_token,
            "#[scenario] only works on async functions",
        ));
    }
    if sig.inputs.len() > 1 {
        return Err(syn::Error::new_spanned(
            &sig.inputs,
            "#[scenario] functions take at most one argument, the `VuContext`",
        ));
    }

    let stmts = &block.stmts;
    let scen_name = sig.ident.clone();
    let new_name = Ident::new(&format!("__volley_{}", sig.ident), Span::call_site());
    let mut new_sig = sig.clone();
    new_sig.ident = new_name.clone();

    let func = if sig.inputs.is_empty() {
        quote! { |_: ::volley::VuContext| #new_name() }
    } else {
        quote! { #new_name }
    };

    let mut scen_sig = sig;
    scen_sig.asyncness = None;
    scen_sig.inputs = Punctuated::new();
    scen_sig.output = syn::parse2(quote! {
        -> impl ::volley::scenario::ConfigurableScenario
    })?;

    Ok(quote! {
        #(#attrs)* #vis #scen_sig {
            ::volley::scenario::Scenario::new(stringify!(#scen_name), #func)
        }

        #(#attrs)* #vis #new_sig {
            #(#stmts)*
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_with_context() {
        let out = scenario_internal(
            quote! {},
            quote! {
                async fn browse(ctx: VuContext) {
                    ctx.http().get("http://localhost").await;
                }
            },
        )
        .unwrap()
        .to_string();

        assert!(out.contains("fn browse ()"), "{out}");
        assert!(out.contains("Scenario :: new (stringify ! (browse) , __volley_browse)"), "{out}");
        assert!(out.contains("async fn __volley_browse (ctx : VuContext)"), "{out}");
    }

    #[test]
    fn scenario_without_arguments() {
        let out = scenario_internal(quote! {}, quote! { async fn idle() {} })
            .unwrap()
            .to_string();
        assert!(out.contains("__volley_idle ()"), "{out}");
    }

    #[test]
    fn rejects_sync_functions() {
        let err = scenario_internal(quote! {}, quote! { fn idle() {} }).unwrap_err();
        assert!(err.to_string().contains("async"));

        let err = transaction_internal(quote! {}, quote! { fn login() -> Result<(), ()> { Ok(()) } })
            .unwrap_err();
        assert!(err.to_string().contains("async"));
    }

    #[test]
    fn transaction_is_named_after_the_function() {
        let out = transaction_internal(
            quote! {},
            quote! { async fn login() -> Result<(), ()> { Ok(()) } },
        )
        .unwrap()
        .to_string();
        assert!(out.contains("transaction_hook (stringify ! (login)"), "{out}");
    }
}
