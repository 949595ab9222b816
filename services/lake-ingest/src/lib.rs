//! Lake Ingest - market-data ingestion pipeline for A-share equities.
//!
//! Periodically synchronizes tabular vendor datasets (daily bars, adjusted
//! bars, daily basics, financial statements, reference lists) into a
//! year-partitioned parquet lake.
//!
//! # Architecture
//!
//! ```text
//! plan (SLOW) ──────────────► download (FAST, rate-limited) ─────► persist (SLOW)
//!   │  incremental ranges       │  one vendor call per task          │  append / replace
//!   └─ catalogue + lake         └─ paired persist enqueued           └─ parquet lake
//!        metadata                  under the same correlation id
//!
//! MAINT: manifest rebuild, partition compaction, swap-leftover sweep
//! ```
//!
//! Component graph, built explicitly at startup: catalogue → rate limiter →
//! lake store → fetcher factory → orchestrator. The vendor credential is
//! read from the environment once and never written to disk.

#![warn(clippy::all)]

pub mod catalog;
pub mod dates;
pub mod fetch;
pub mod frame;
pub mod limit;
pub mod queue;
pub mod store;
pub mod vendor;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use lake_common::config::Config;
use lake_common::error::FatalError;

use crate::catalog::Catalog;
use crate::limit::RateLimitManager;
use crate::queue::{Orchestrator, TaskStore};
use crate::store::DatasetStore;
use crate::vendor::{TushareClient, VendorApi};

/// Build the full pipeline against the real vendor client.
///
/// Fails with a configuration error when the catalogue is unreadable or the
/// credential environment variable is unset.
pub fn build(config: &Config, cancel: CancellationToken) -> Result<Orchestrator, FatalError> {
    let token = config.vendor_token().ok_or_else(|| {
        FatalError::Config(format!(
            "vendor token not found in environment variable {}",
            config.vendor.token_env
        ))
    })?;
    let vendor: Arc<dyn VendorApi> = Arc::new(TushareClient::new(token, &config.vendor));
    build_with_vendor(config, vendor, cancel)
}

/// Build the pipeline with an injected vendor implementation.
pub fn build_with_vendor(
    config: &Config,
    vendor: Arc<dyn VendorApi>,
    cancel: CancellationToken,
) -> Result<Orchestrator, FatalError> {
    let catalog = Arc::new(
        Catalog::load(&config.storage.catalog_path).map_err(FatalError::config)?,
    );
    let limiter = Arc::new(RateLimitManager::new(config.rate_limits.clone()));
    let lake = Arc::new(DatasetStore::new(
        config.storage.root.clone(),
        Arc::clone(&catalog),
    ));
    let queue_store =
        Arc::new(TaskStore::open(&config.storage.queue_db).map_err(FatalError::runtime)?);

    Ok(Orchestrator::new(
        config,
        catalog,
        limiter,
        lake,
        vendor,
        queue_store,
        cancel,
    ))
}
