//! Vendor API adapter for A-share market data.
//!
//! The vendor exposes a single POST endpoint taking a method name, the
//! account token and named string parameters, and returns a tabular payload
//! as `fields` + `items`. This module wraps that surface behind the
//! [`VendorApi`] trait so the pipeline (and tests) never depend on the
//! concrete HTTP client.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use lake_common::config::VendorConfig;

use crate::frame::Frame;

/// Vendor error taxonomy.
#[derive(Error, Debug)]
pub enum VendorError {
    /// The call exceeded the configured timeout
    #[error("vendor call timed out")]
    Timeout,

    /// The vendor rejected the call for exceeding the per-minute cap
    #[error("vendor rate limit exceeded: {0}")]
    RateLimited(String),

    /// HTTP 5xx from the vendor
    #[error("vendor server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    /// The vendor rejected the request itself (bad method, bad params, 4xx)
    #[error("vendor rejected request: {0}")]
    BadRequest(String),

    /// Structurally empty response (no data section at all)
    #[error("vendor returned no data section")]
    Empty,

    /// Connection-level failure
    #[error("vendor transport error: {0}")]
    Transport(String),
}

impl VendorError {
    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited(_) | Self::ServerError { .. } | Self::Transport(_)
        )
    }

    /// Short stable label for dead-letter records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited(_) => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::BadRequest(_) => "bad_request",
            Self::Empty => "empty",
            Self::Transport(_) => "transport",
        }
    }
}

/// One vendor method invocation. Implementations do no rate limiting of
/// their own; callers go through the rate-limit manager first.
#[async_trait]
pub trait VendorApi: Send + Sync {
    /// Invoke `method` with bound parameters, optionally restricting the
    /// returned columns to `fields` (empty = vendor default column set).
    async fn invoke(
        &self,
        method: &str,
        params: &BTreeMap<String, String>,
        fields: &[String],
    ) -> Result<Frame, VendorError>;
}

// ============================================================================
// HTTP client
// ============================================================================

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    api_name: &'a str,
    token: &'a str,
    params: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<ApiData>,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    items: Vec<Vec<serde_json::Value>>,
}

/// Tushare-protocol HTTP client.
pub struct TushareClient {
    token: String,
    client: reqwest::Client,
    base_url: String,
}

impl TushareClient {
    /// Build the client. The token comes from the environment at startup and
    /// lives only in memory.
    pub fn new(token: impl Into<String>, config: &VendorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            token: token.into(),
            client,
            base_url: config.base_url.clone(),
        }
    }

    fn map_transport(err: reqwest::Error) -> VendorError {
        if err.is_timeout() {
            VendorError::Timeout
        } else {
            VendorError::Transport(err.to_string())
        }
    }

    /// Classify a vendor body error code. The per-minute cap surfaces as a
    /// nonzero code with a message naming the limit.
    fn map_body_error(code: i64, msg: &str) -> VendorError {
        if msg.contains("每分钟") || msg.contains("最多访问") || code == 40203 {
            VendorError::RateLimited(msg.to_string())
        } else {
            VendorError::BadRequest(format!("code {code}: {msg}"))
        }
    }
}

#[async_trait]
impl VendorApi for TushareClient {
    async fn invoke(
        &self,
        method: &str,
        params: &BTreeMap<String, String>,
        fields: &[String],
    ) -> Result<Frame, VendorError> {
        let request = ApiRequest {
            api_name: method,
            token: &self.token,
            params,
            fields: if fields.is_empty() {
                None
            } else {
                Some(fields.join(","))
            },
        };

        let response = self
            .client
            .post(&self.base_url)
            .json(&request)
            .send()
            .await
            .map_err(Self::map_transport)?;

        let status = response.status();
        if status.is_server_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(VendorError::ServerError {
                status: status.as_u16(),
                message,
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(VendorError::BadRequest(format!("{status}: {message}")));
        }

        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| VendorError::Transport(format!("malformed response: {e}")))?;

        if body.code != 0 {
            return Err(Self::map_body_error(
                body.code,
                body.msg.as_deref().unwrap_or(""),
            ));
        }

        let data = body.data.ok_or(VendorError::Empty)?;
        let frame = Frame::from_vendor(data.fields, data.items)
            .map_err(|e| VendorError::Transport(format!("ragged payload: {e}")))?;

        debug!(method, rows = frame.len(), "Vendor call succeeded");
        Ok(frame)
    }
}
