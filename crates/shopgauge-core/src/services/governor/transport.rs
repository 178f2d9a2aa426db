//! GraphQL transport
//!
//! The governor never talks HTTP directly: it hands documents to a
//! [`Transport`] and inspects the typed response. [`HttpTransport`] is the
//! Shopify Admin API implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::types::CostExtensions;

/// Admin API version used when none is configured
pub const DEFAULT_API_VERSION: &str = "2025-01";

/// HTTP request timeout in seconds
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Error code Shopify uses for throttled queries
pub const THROTTLED_CODE: &str = "THROTTLED";

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while executing a GraphQL document
#[derive(Error, Debug)]
pub enum TransportError {
    /// Request never produced a response
    #[error("Network error: {0}")]
    Network(String),

    /// Access token missing, invalid or lacking scope
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Non-success HTTP status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Response body was not a GraphQL response
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Network("Request timed out".to_string())
        } else if err.is_connect() {
            TransportError::Network("Connection failed".to_string())
        } else if err.is_decode() {
            TransportError::Parse(err.to_string())
        } else if let Some(status) = err.status() {
            match status.as_u16() {
                401 | 403 => TransportError::Unauthorized(format!("HTTP {}", status)),
                code => TransportError::Http {
                    status: code,
                    body: err.to_string(),
                },
            }
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Parse(err.to_string())
    }
}

// ============================================================================
// Response Types
// ============================================================================

/// One entry of a GraphQL `errors` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQlError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            extensions: None,
        }
    }

    /// `extensions.code`, if present
    pub fn code(&self) -> Option<&str> {
        self.extensions.as_ref()?.get("code")?.as_str()
    }
}

/// Top-level `extensions` of a response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseExtensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostExtensions>,
}

/// A GraphQL response as returned by the Admin API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQlResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GraphQlError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<ResponseExtensions>,
}

impl GraphQlResponse {
    /// Cost metadata, if the server reported any
    pub fn cost(&self) -> Option<&CostExtensions> {
        self.extensions.as_ref()?.cost.as_ref()
    }

    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|errors| !errors.is_empty())
    }

    /// Whether the server refused the query for lack of budget
    ///
    /// Either an error carries the `THROTTLED` code, or no data came back
    /// and the bucket holds less than the query requested.
    pub fn is_throttled(&self) -> bool {
        let throttled_error = self
            .errors
            .iter()
            .flatten()
            .any(|e| e.code() == Some(THROTTLED_CODE));
        if throttled_error {
            return true;
        }

        let no_data = self.data.as_ref().map_or(true, Value::is_null);
        match self.cost() {
            Some(cost) if no_data => {
                cost.throttle_status.currently_available < cost.requested_query_cost
            }
            _ => false,
        }
    }
}

// ============================================================================
// Transport Trait
// ============================================================================

/// Executes GraphQL documents against a remote API
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        document: &str,
        variables: Option<Value>,
    ) -> Result<GraphQlResponse, TransportError>;
}

// ============================================================================
// HTTP Transport
// ============================================================================

/// Shopify Admin GraphQL API over HTTPS
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    access_token: String,
}

impl HttpTransport {
    /// Transport for `shop` (e.g. `my-store.myshopify.com`)
    pub fn new(shop: &str, access_token: impl Into<String>) -> Self {
        Self::with_api_version(shop, access_token, DEFAULT_API_VERSION)
    }

    pub fn with_api_version(
        shop: &str,
        access_token: impl Into<String>,
        api_version: &str,
    ) -> Self {
        let shop = shop
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        Self::with_endpoint(
            format!("https://{}/admin/api/{}/graphql.json", shop, api_version),
            access_token,
        )
    }

    /// Transport posting to an explicit URL
    pub fn with_endpoint(endpoint: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            client: build_client(Duration::from_secs(REQUEST_TIMEOUT_SECS)),
            endpoint: endpoint.into(),
            access_token: access_token.into(),
        }
    }

    /// Replace the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn build_client(timeout: Duration) -> Client {
    Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        log::warn!(
            "[governor:transport] Failed to build HTTP client ({}), requests have no timeout",
            e
        );
        Client::new()
    })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        document: &str,
        variables: Option<Value>,
    ) -> Result<GraphQlResponse, TransportError> {
        let mut body = serde_json::json!({ "query": document });
        if let Some(variables) = variables {
            body["variables"] = variables;
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Shopify-Access-Token", &self.access_token)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .header("User-Agent", concat!("shopgauge/", env!("CARGO_PKG_VERSION")))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            log::warn!("[governor:transport] Request rejected: HTTP {}", status);
            return Err(TransportError::Unauthorized(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("[governor:transport] Request failed: HTTP {}", status);
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        let parsed: GraphQlResponse = serde_json::from_str(&text).map_err(|e| {
            log::error!("[governor:transport] Failed to parse response: {}", e);
            TransportError::Parse(format!("Invalid GraphQL response: {}", e))
        })?;
        Ok(parsed)
    }
}

// ============================================================================
// Tests
// ============================================================================
