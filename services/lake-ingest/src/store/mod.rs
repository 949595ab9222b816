//! Persistence layer: the year-partitioned parquet lake.
//!
//! [`DatasetStore`] is the facade the orchestrator talks to. It dispatches a
//! persist to the dataset's update strategy, answers incremental-planning
//! queries, and runs the maintenance operations (manifest rebuild,
//! compaction, swap-leftover sweep).

pub mod compact;
pub mod convert;
pub mod layout;
pub mod manifest;
pub mod meta;
pub mod writer;

pub use compact::CompactOutcome;
pub use layout::LakeLayout;
pub use manifest::Manifest;
pub use writer::{AppendOutcome, ReplaceOutcome};

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{debug, info};

use crate::catalog::{Catalog, UpdateStrategy};
use crate::frame::Frame;
use meta::MetaReader;

/// How many rows a persist landed, and with which strategy.
#[derive(Debug)]
pub struct PersistOutcome {
    pub strategy: UpdateStrategy,
    pub rows: usize,
}

/// Facade over the lake for one catalogue.
pub struct DatasetStore {
    layout: LakeLayout,
    meta: MetaReader,
    catalog: Arc<Catalog>,
}

impl DatasetStore {
    pub fn new(root: impl Into<std::path::PathBuf>, catalog: Arc<Catalog>) -> Self {
        let layout = LakeLayout::new(root);
        let meta = MetaReader::new(layout.clone());
        Self {
            layout,
            meta,
            catalog,
        }
    }

    pub fn layout(&self) -> &LakeLayout {
        &self.layout
    }

    /// Apply the dataset's update strategy to a downloaded frame.
    pub fn persist(&self, task_name: &str, frame: &Frame) -> Result<PersistOutcome> {
        let descriptor = self.catalog.get(task_name)?;
        match descriptor.update_strategy {
            UpdateStrategy::Incremental => {
                let date_column = descriptor
                    .date_column
                    .as_deref()
                    .context("incremental dataset without a date column")?;
                let outcome = writer::append(&self.layout, task_name, date_column, frame)?;
                Ok(PersistOutcome {
                    strategy: UpdateStrategy::Incremental,
                    rows: outcome.rows,
                })
            }
            UpdateStrategy::FullReplace => {
                let outcome = writer::replace(
                    &self.layout,
                    task_name,
                    descriptor.date_column.as_deref(),
                    frame,
                )?;
                Ok(PersistOutcome {
                    strategy: UpdateStrategy::FullReplace,
                    rows: outcome.rows,
                })
            }
        }
    }

    /// Latest date on disk for (dataset, symbol). `None` means no rows yet.
    ///
    /// Datasets without a date column always answer `None`; their planning
    /// path refetches the whole table.
    pub fn latest_date(
        &self,
        task_name: &str,
        symbol_filter: Option<(&str, &str)>,
    ) -> Result<Option<NaiveDate>> {
        let descriptor = self.catalog.get(task_name)?;
        let Some(date_column) = descriptor.date_column.as_deref() else {
            return Ok(None);
        };
        self.meta.latest_date(task_name, date_column, symbol_filter)
    }

    /// Distinct values of a column, for the symbol universe.
    pub fn symbols(&self, dataset: &str, column: &str) -> Result<Vec<String>> {
        self.meta.distinct_strings(dataset, column)
    }

    /// Total rows of a dataset.
    pub fn count_rows(&self, dataset: &str) -> Result<u64> {
        self.meta.count_rows(dataset)
    }

    /// Rebuild the manifest from the directory tree and publish a snapshot.
    pub fn rebuild_manifest(&self) -> Result<Manifest> {
        let manifest = Manifest::scan(&self.layout)?;
        manifest.write_snapshot(&self.layout)?;
        info!(files = manifest.files.len(), "Rebuilt lake manifest");
        Ok(manifest)
    }

    /// Compact a dataset's multi-file partitions.
    pub fn compact(&self, task_name: &str) -> Result<CompactOutcome> {
        let descriptor = self.catalog.get(task_name)?;
        compact::compact(&self.layout, task_name, &descriptor.primary_key)
    }

    /// Delete swap leftovers (`.old-*`, orphaned `.staging-*`) and stray
    /// temp files. Returns how many entries were removed.
    pub fn sweep(&self) -> Result<usize> {
        let mut removed = 0usize;
        let root = self.layout.root();
        if !root.exists() {
            return Ok(0);
        }

        for entry in fs::read_dir(root).with_context(|| format!("read {}", root.display()))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if LakeLayout::is_swap_leftover(&name) {
                fs::remove_dir_all(entry.path())
                    .with_context(|| format!("remove {}", entry.path().display()))?;
                debug!(entry = %name, "Swept swap leftover");
                removed += 1;
            } else if entry.path().is_dir() {
                removed += sweep_temp_files(&entry.path())?;
            }
        }
        Ok(removed)
    }
}

fn sweep_temp_files(dir: &Path) -> Result<usize> {
    let mut removed = 0usize;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.path().is_dir() {
            removed += sweep_temp_files(&entry.path())?;
        } else if name.starts_with(".tmp-") {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Cell;

    const CATALOG: &str = r#"
[dataset.stock_daily]
primary_key = ["ts_code", "trade_date"]
date_column = "trade_date"
strategy = "incremental"
per_symbol = true
[dataset.stock_daily.api]
method = "daily"

[dataset.stock_basic]
primary_key = ["ts_code"]
strategy = "full_replace"
per_symbol = false
[dataset.stock_basic.api]
method = "stock_basic"
"#;

    fn store(dir: &Path) -> DatasetStore {
        let catalog = Arc::new(Catalog::parse(CATALOG, "test").unwrap());
        DatasetStore::new(dir, catalog)
    }

    fn daily_frame(rows: &[(&str, &str)]) -> Frame {
        let mut frame = Frame::new(vec!["ts_code".into(), "trade_date".into(), "close".into()]);
        for (code, date) in rows {
            frame
                .push_row(vec![
                    Cell::Str((*code).into()),
                    Cell::Str((*date).into()),
                    Cell::Float(1.0),
                ])
                .unwrap();
        }
        frame
    }

    #[test]
    fn test_persist_dispatches_by_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let outcome = store
            .persist("stock_daily", &daily_frame(&[("600519.SH", "20240315")]))
            .unwrap();
        assert_eq!(outcome.strategy, UpdateStrategy::Incremental);
        assert_eq!(outcome.rows, 1);

        let mut basic = Frame::new(vec!["ts_code".into()]);
        basic.push_row(vec![Cell::Str("600519.SH".into())]).unwrap();
        let outcome = store.persist("stock_basic", &basic).unwrap();
        assert_eq!(outcome.strategy, UpdateStrategy::FullReplace);
    }

    #[test]
    fn test_latest_date_per_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        store
            .persist(
                "stock_daily",
                &daily_frame(&[("600519.SH", "20240315"), ("000001.SZ", "20240310")]),
            )
            .unwrap();

        assert_eq!(
            store
                .latest_date("stock_daily", Some(("ts_code", "600519.SH")))
                .unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 15)
        );
        assert_eq!(
            store.latest_date("stock_basic", None).unwrap(),
            None,
            "datasets without a date column have no latest date"
        );
    }

    #[test]
    fn test_sweep_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .persist("stock_daily", &daily_frame(&[("600519.SH", "20240315")]))
            .unwrap();

        fs::create_dir_all(dir.path().join(".old-stock_basic-x")).unwrap();
        fs::create_dir_all(dir.path().join(".staging-stock_basic-y")).unwrap();
        fs::write(
            store.layout().year_dir("stock_daily", 2024).join(".tmp-part-z.parquet"),
            b"junk",
        )
        .unwrap();

        assert_eq!(store.sweep().unwrap(), 3);
        assert_eq!(store.sweep().unwrap(), 0);
    }

    #[test]
    fn test_rebuild_manifest_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .persist("stock_daily", &daily_frame(&[("600519.SH", "20240315")]))
            .unwrap();

        let manifest = store.rebuild_manifest().unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert!(store.layout().manifest_path().exists());
    }
}
