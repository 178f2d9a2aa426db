//! Query command
//!
//! Runs one GraphQL document against the Admin API through the governor,
//! so usage, alerts and notifications land in the CLI database.

use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::Args;
use serde_json::Value;

use shopgauge_core::services::governor::{HttpTransport, RequestOptions, DEFAULT_API_VERSION};

use super::Context;
use crate::output::{print_error, print_info, print_json, print_warning};

#[derive(Args)]
pub struct QueryArgs {
    /// GraphQL document, or @path to read it from a file
    pub document: String,

    /// Variables as a JSON object
    #[arg(long)]
    pub variables: Option<String>,

    /// Expected cost, used to hold or reject the request locally
    #[arg(long)]
    pub estimated_cost: Option<f64>,

    /// Run as a tracked mutation with this name
    #[arg(long)]
    pub mutation: Option<String>,

    /// Shop domain (my-shop or my-shop.myshopify.com)
    #[arg(long, env = "SHOPIFY_SHOP")]
    pub shop: Option<String>,

    /// Admin API access token
    #[arg(long, env = "SHOPIFY_ACCESS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Admin API version
    #[arg(long, default_value = DEFAULT_API_VERSION)]
    pub api_version: String,

    /// Endpoint label for usage analytics
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Operation label for usage analytics
    #[arg(long)]
    pub operation: Option<String>,
}

impl QueryArgs {
    fn request_options(&self) -> RequestOptions {
        let mut options = RequestOptions::new();
        if let Some(endpoint) = &self.endpoint {
            options = options.with_endpoint(endpoint.clone());
        }
        if let Some(operation) = &self.operation {
            options = options.with_operation(operation.clone());
        }
        if let Some(cost) = self.estimated_cost {
            options = options.with_estimated_cost(cost);
        }
        options
    }
}

pub async fn execute(ctx: &Context, args: QueryArgs) -> Result<()> {
    let Some(token) = args.token.clone() else {
        bail!("Missing access token: pass --token or set SHOPIFY_ACCESS_TOKEN");
    };
    let Some(shop) = args.shop.clone() else {
        bail!("Missing shop: pass --shop or set SHOPIFY_SHOP");
    };

    let document = read_document(&args.document)?;
    let variables = parse_variables(args.variables.as_deref())?;

    let transport = Arc::new(HttpTransport::with_api_version(
        &shop,
        token,
        &args.api_version,
    ));
    print_info(&format!("POST {}", transport.endpoint()), ctx.quiet);

    let governor = ctx.governor(transport).await;
    let options = args.request_options();

    let result = match &args.mutation {
        Some(name) => {
            governor
                .mutate(name, &document, variables, None, options)
                .await
        }
        None => governor.request(&document, variables, options).await,
    };
    governor.shutdown().await;
    let response = result?;

    if response.is_throttled() {
        print_warning("Request was throttled by Shopify", ctx.quiet);
    }
    for error in response.errors.iter().flatten() {
        print_error(&error.message);
    }

    print_json(&response)
}

/// Inline document, or file contents for `@path`
fn read_document(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read GraphQL document from {}", path)),
        None => Ok(arg.to_string()),
    }
}

fn parse_variables(raw: Option<&str>) -> Result<Option<Value>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw).context("Invalid --variables JSON")?;
    if !value.is_object() {
        bail!("--variables must be a JSON object");
    }
    Ok(Some(value))
}
