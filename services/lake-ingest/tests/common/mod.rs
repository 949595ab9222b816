//! Shared fixtures for the pipeline tests: a scripted in-process vendor and
//! a workspace wired onto a temp directory.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

use lake_common::config::Config;
use lake_ingest::frame::{Cell, Frame};
use lake_ingest::queue::Orchestrator;
use lake_ingest::vendor::{VendorApi, VendorError};

pub const TEST_CATALOG: &str = r#"
[dataset.stock_daily]
description = "Daily bars"
primary_key = ["ts_code", "trade_date"]
date_column = "trade_date"
strategy = "incremental"
per_symbol = true
columns = ["ts_code", "trade_date", "close"]

[dataset.stock_daily.api]
method = "daily"

[dataset.ref_list]
description = "Reference list"
primary_key = ["ts_code"]
strategy = "full_replace"
per_symbol = false
columns = ["ts_code", "name"]

[dataset.ref_list.api]
method = "stock_basic"

[groups]
daily = ["stock_daily"]
refs = ["ref_list"]
"#;

/// One recorded vendor call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub method: String,
    pub params: BTreeMap<String, String>,
}

/// Scripted vendor: serves daily bars from a fixed table and reference rows
/// from a fixed list, with optional injected one-shot timeouts.
#[derive(Default)]
pub struct MockVendor {
    /// (ts_code, trade_date, close) rows served by the `daily` method
    daily_rows: Vec<(String, String, f64)>,
    /// (ts_code, name) rows served by the `stock_basic` method
    ref_rows: Vec<(String, String)>,
    /// ts_codes whose next daily call fails with a timeout
    fail_once: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<CallRecord>>,
}

impl MockVendor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_daily(mut self, rows: &[(&str, &str, f64)]) -> Self {
        self.daily_rows = rows
            .iter()
            .map(|(c, d, v)| (c.to_string(), d.to_string(), *v))
            .collect();
        self
    }

    pub fn with_refs(mut self, rows: &[(&str, &str)]) -> Self {
        self.ref_rows = rows
            .iter()
            .map(|(c, n)| (c.to_string(), n.to_string()))
            .collect();
        self
    }

    pub fn fail_next_daily(&self, ts_code: &str) {
        self.fail_once.lock().unwrap().insert(ts_code.to_string());
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == method)
            .count()
    }
}

#[async_trait]
impl VendorApi for MockVendor {
    async fn invoke(
        &self,
        method: &str,
        params: &BTreeMap<String, String>,
        _fields: &[String],
    ) -> Result<Frame, VendorError> {
        self.calls.lock().unwrap().push(CallRecord {
            method: method.to_string(),
            params: params.clone(),
        });

        match method {
            "daily" => {
                let ts_code = params.get("ts_code").cloned().unwrap_or_default();
                if self.fail_once.lock().unwrap().remove(&ts_code) {
                    return Err(VendorError::Timeout);
                }

                let start = params.get("start_date").cloned().unwrap_or_default();
                let end = params
                    .get("end_date")
                    .cloned()
                    .unwrap_or_else(|| "99999999".into());

                let mut frame = Frame::new(vec![
                    "ts_code".into(),
                    "trade_date".into(),
                    "close".into(),
                ]);
                for (code, date, close) in &self.daily_rows {
                    if *code == ts_code && *date >= start && *date <= end {
                        frame
                            .push_row(vec![
                                Cell::Str(code.clone()),
                                Cell::Str(date.clone()),
                                Cell::Float(*close),
                            ])
                            .expect("mock row width");
                    }
                }
                Ok(frame)
            }
            "stock_basic" => {
                let mut frame = Frame::new(vec!["ts_code".into(), "name".into()]);
                for (code, name) in &self.ref_rows {
                    frame
                        .push_row(vec![Cell::Str(code.clone()), Cell::Str(name.clone())])
                        .expect("mock row width");
                }
                Ok(frame)
            }
            other => Err(VendorError::BadRequest(format!("unknown method {other}"))),
        }
    }
}

/// A test workspace: catalogue + lake + queue store under one temp dir.
pub struct TestBed {
    pub dir: tempfile::TempDir,
    pub config: Config,
    pub cancel: CancellationToken,
}

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
}

impl TestBed {
    pub fn new(symbols: &[&str]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("catalog.toml"), TEST_CATALOG).expect("write catalog");

        let mut config = Config::default();
        config.storage.root = dir.path().join("lake");
        config.storage.catalog_path = dir.path().join("catalog.toml");
        config.storage.queue_db = dir.path().join("queue.db");
        config.queues.fast_workers = 4;
        config.retry.base_delay_ms = 5;
        config.planner.symbol_dataset = "ref_list".into();
        config.planner.symbol_override = symbols.iter().map(|s| s.to_string()).collect();

        Self {
            dir,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Build and start an orchestrator over this workspace.
    pub async fn orchestrator(&self, vendor: Arc<MockVendor>) -> Orchestrator {
        let mut orchestrator =
            lake_ingest::build_with_vendor(&self.config, vendor, self.cancel.clone())
                .expect("build pipeline")
                .with_today(today());
        orchestrator.start().await.expect("start pools");
        orchestrator
    }

    /// A read-only view over the lake, the way an analytical reader sees it.
    pub fn lake(&self) -> lake_ingest::store::DatasetStore {
        let catalog = Arc::new(
            lake_ingest::catalog::Catalog::parse(TEST_CATALOG, "test").expect("catalog"),
        );
        lake_ingest::store::DatasetStore::new(self.config.storage.root.clone(), catalog)
    }

    pub fn lake_root(&self) -> &Path {
        self.config.storage.root.as_path()
    }
}
