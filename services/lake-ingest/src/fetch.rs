//! Metadata-driven fetcher factory.
//!
//! [`FetcherBuilder::build`] turns a task name plus bound parameters into a
//! ready-to-run [`Fetcher`]. Building is pure — it only consults the
//! catalogue and validates the binding. Running applies the rate limit and
//! performs exactly one vendor call. Adding a dataset needs a catalogue
//! entry, never new fetch code.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::catalog::{Catalog, CatalogError};
use crate::frame::Frame;
use crate::limit::{AcquireError, RateLimitManager};
use crate::queue::TaskParams;
use crate::vendor::{VendorApi, VendorError};

/// Errors from building or running a fetcher.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("bad parameters for {task}: {message}")]
    BadParams { task: String, message: String },

    #[error("schema mismatch for {task}: missing columns {missing:?}")]
    SchemaMismatch { task: String, missing: Vec<String> },

    #[error(transparent)]
    Vendor(#[from] VendorError),

    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether the failure is worth a retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Vendor(v) if v.is_transient())
    }

    /// Short stable label for dead-letter records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTask(_) => "unknown_task",
            Self::BadParams { .. } => "bad_params",
            Self::SchemaMismatch { .. } => "schema_mismatch",
            Self::Vendor(v) => v.kind(),
            Self::Cancelled => "cancelled",
        }
    }
}

/// Normalize a stock code into the vendor's `ts_code` form.
///
/// Accepts bare six-digit codes (exchange inferred from the leading digit)
/// or codes already carrying an exchange suffix.
pub fn normalize_stock_code(symbol: &str) -> Result<String, String> {
    let symbol = symbol.trim();
    if let Some((code, exchange)) = symbol.split_once('.') {
        if code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(format!("{code}.{}", exchange.to_ascii_uppercase()));
        }
        return Err(format!("malformed stock code '{symbol}'"));
    }
    if symbol.len() == 6 && symbol.bytes().all(|b| b.is_ascii_digit()) {
        let exchange = match symbol.as_bytes()[0] {
            b'6' | b'9' => "SH",
            b'0' | b'2' | b'3' => "SZ",
            b'4' | b'8' => "BJ",
            _ => return Err(format!("cannot infer exchange for '{symbol}'")),
        };
        return Ok(format!("{symbol}.{exchange}"));
    }
    Err(format!("malformed stock code '{symbol}'"))
}

/// A bound, ready-to-run vendor call.
#[derive(Debug, Clone)]
pub struct Fetcher {
    task_name: String,
    method: String,
    params: BTreeMap<String, String>,
    expected_columns: Vec<String>,
}

impl Fetcher {
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Bound call parameters (defaults + runtime binding).
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Acquire a rate token, invoke the vendor, and verify the response
    /// carries the declared columns. Extra columns are kept as returned.
    pub async fn call(
        &self,
        limiter: &RateLimitManager,
        vendor: &dyn VendorApi,
        cancel: &CancellationToken,
    ) -> Result<Frame, FetchError> {
        match limiter.acquire(&self.task_name, cancel).await {
            Ok(()) => {}
            Err(AcquireError::Cancelled) => return Err(FetchError::Cancelled),
        }

        let frame = vendor
            .invoke(&self.method, &self.params, &self.expected_columns)
            .await?;

        if !self.expected_columns.is_empty() {
            let missing = frame.missing_columns(&self.expected_columns);
            if !missing.is_empty() {
                return Err(FetchError::SchemaMismatch {
                    task: self.task_name.clone(),
                    missing: missing.into_iter().map(String::from).collect(),
                });
            }
        }

        debug!(
            task = %self.task_name,
            method = %self.method,
            rows = frame.len(),
            "Fetch completed"
        );
        Ok(frame)
    }
}

/// Builds fetchers from the catalogue.
pub struct FetcherBuilder {
    catalog: Arc<Catalog>,
}

impl FetcherBuilder {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// Bind `params` onto the dataset's API descriptor.
    ///
    /// Pure: no I/O happens until [`Fetcher::call`]. Unknown extra parameter
    /// names and missing required ones are rejected here.
    pub fn build(&self, task_name: &str, params: &TaskParams) -> Result<Fetcher, FetchError> {
        let descriptor = self.catalog.get(task_name).map_err(|e| match e {
            CatalogError::UnknownTask(name) => FetchError::UnknownTask(name),
            other => FetchError::BadParams {
                task: task_name.to_string(),
                message: other.to_string(),
            },
        })?;

        let bad = |message: String| FetchError::BadParams {
            task: task_name.to_string(),
            message,
        };

        let mut bound = descriptor.api.default_params.clone();

        match (&params.symbol, descriptor.per_symbol) {
            (Some(symbol), _) => {
                let ts_code = normalize_stock_code(symbol).map_err(&bad)?;
                bound.insert("ts_code".to_string(), ts_code);
            }
            (None, true) => {
                return Err(bad("per-symbol dataset requires a symbol".to_string()));
            }
            (None, false) => {}
        }

        if let Some(start) = &params.start {
            bound.insert("start_date".to_string(), start.clone());
        }
        if let Some(end) = &params.end {
            bound.insert("end_date".to_string(), end.clone());
        }

        // Extra parameters may only override declared defaults.
        for (key, value) in &params.extra {
            if !descriptor.api.default_params.contains_key(key) {
                return Err(bad(format!("unknown parameter '{key}'")));
            }
            bound.insert(key.clone(), value.clone());
        }

        Ok(Fetcher {
            task_name: task_name.to_string(),
            method: descriptor.api.method.clone(),
            params: bound,
            expected_columns: descriptor.columns.clone(),
        })
    }
}
