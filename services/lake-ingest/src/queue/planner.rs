//! Plan expansion: from a task group to per-symbol download tasks.
//!
//! For every dataset in the group the planner computes the incremental date
//! range still missing on disk and emits one download per unit of work.
//! A unit that is already up to date is skipped entirely; a unit whose
//! planning fails is logged and skipped — a single bad symbol never aborts
//! the rest of the plan.

use std::sync::Arc;

use chrono::{Days, NaiveDate};
use tracing::{debug, info, warn};

use lake_common::config::PlannerConfig;

use super::task::{Task, TaskError, TaskParams};
use crate::catalog::Catalog;
use crate::dates;
use crate::fetch::normalize_stock_code;
use crate::store::DatasetStore;

/// What a plan expansion produced.
#[derive(Debug, Default)]
pub struct PlanOutcome {
    /// Download tasks to enqueue onto FAST, in enumeration order
    pub downloads: Vec<Task>,
    /// Units skipped because their incremental range was empty
    pub up_to_date: usize,
    /// Units skipped because planning them failed
    pub unit_errors: usize,
}

/// Expands task groups using the catalogue and the lake's metadata.
pub struct Planner {
    catalog: Arc<Catalog>,
    store: Arc<DatasetStore>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(catalog: Arc<Catalog>, store: Arc<DatasetStore>, config: PlannerConfig) -> Self {
        Self {
            catalog,
            store,
            config,
        }
    }

    /// Expand `group` into download tasks, with `today` as the range end.
    pub fn expand(&self, group: &str, today: NaiveDate) -> Result<PlanOutcome, TaskError> {
        let members = self
            .catalog
            .group(group)
            .map_err(|e| TaskError::permanent("unknown_group", e))?;

        let mut outcome = PlanOutcome::default();
        let mut universe: Option<Vec<String>> = None;

        for task_name in members {
            let descriptor = self
                .catalog
                .get(task_name)
                .map_err(|e| TaskError::permanent("unknown_task", e))?;

            if !descriptor.per_symbol {
                outcome
                    .downloads
                    .push(Task::download(task_name.clone(), TaskParams::default()));
                continue;
            }

            // The universe is resolved once per plan and shared by every
            // per-symbol dataset in the group.
            if universe.is_none() {
                universe = Some(self.symbol_universe()?);
            }
            let symbols = universe.as_deref().unwrap_or(&[]);
            if symbols.is_empty() {
                warn!(
                    dataset = %task_name,
                    source = %self.config.symbol_dataset,
                    "Symbol universe is empty, skipping dataset (ingest the reference list first)"
                );
                outcome.unit_errors += 1;
                continue;
            }

            for symbol in symbols {
                match self.plan_symbol(task_name, symbol, today) {
                    Ok(Some(task)) => outcome.downloads.push(task),
                    Ok(None) => outcome.up_to_date += 1,
                    Err(err) => {
                        warn!(
                            dataset = %task_name,
                            symbol = %symbol,
                            error = %err,
                            "Planning unit failed, continuing with the rest of the plan"
                        );
                        outcome.unit_errors += 1;
                    }
                }
            }
        }

        info!(
            group,
            downloads = outcome.downloads.len(),
            up_to_date = outcome.up_to_date,
            unit_errors = outcome.unit_errors,
            "Plan expanded"
        );
        Ok(outcome)
    }

    /// Compute the incremental range for one (dataset, symbol) unit.
    ///
    /// `None` means the unit is already up to date and nothing is enqueued.
    fn plan_symbol(
        &self,
        task_name: &str,
        symbol: &str,
        today: NaiveDate,
    ) -> anyhow::Result<Option<Task>> {
        let latest = self
            .store
            .latest_date(task_name, Some((&self.config.symbol_column, symbol)))?;

        let start = match latest {
            // Everything up to and including today is on disk.
            Some(latest) if latest >= today => {
                debug!(dataset = %task_name, symbol, "Up to date, skipping");
                return Ok(None);
            }
            Some(latest) => Some(latest + Days::new(1)),
            // Nothing on disk yet: fetch full history by leaving start unbound.
            None => None,
        };

        Ok(Some(Task::download(
            task_name,
            TaskParams {
                symbol: Some(symbol.to_string()),
                start: start.map(dates::format_compact),
                end: Some(dates::format_compact(today)),
                extra: Default::default(),
            },
        )))
    }

    /// The symbol universe: config override when present, else the distinct
    /// symbol column of the reference dataset.
    fn symbol_universe(&self) -> Result<Vec<String>, TaskError> {
        if !self.config.symbol_override.is_empty() {
            let mut symbols = Vec::with_capacity(self.config.symbol_override.len());
            for raw in &self.config.symbol_override {
                match normalize_stock_code(raw) {
                    Ok(symbol) => symbols.push(symbol),
                    Err(err) => warn!(symbol = %raw, error = %err, "Skipping malformed override symbol"),
                }
            }
            return Ok(symbols);
        }

        self.store
            .symbols(&self.config.symbol_dataset, &self.config.symbol_column)
            // The reference dataset may be mid-replace; retry the plan.
            .map_err(|e| TaskError::transient("symbol_universe", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Cell, Frame};

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

[groups]
daily = ["stock_daily"]
basic = ["stock_basic"]
"#;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn planner_with(
        dir: &std::path::Path,
        overrides: &[&str],
    ) -> (Planner, Arc<DatasetStore>) {
        let catalog = Arc::new(Catalog::parse(CATALOG, "test").unwrap());
        let store = Arc::new(DatasetStore::new(dir, Arc::clone(&catalog)));
        let config = PlannerConfig {
            symbol_override: overrides.iter().map(|s| s.to_string()).collect(),
            ..PlannerConfig::default()
        };
        (
            Planner::new(catalog, Arc::clone(&store), config),
            store,
        )
    }

    fn seed_daily(store: &DatasetStore, rows: &[(&str, &str)]) {
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
        store.persist("stock_daily", &frame).unwrap();
    }

    #[test]
    fn test_first_run_requests_full_history() {
        let dir = tempfile::tempdir().unwrap();
        let (planner, _store) = planner_with(dir.path(), &["600519.SH", "000001.SZ"]);

        let outcome = planner.expand("daily", today()).unwrap();
        assert_eq!(outcome.downloads.len(), 2);
        assert_eq!(outcome.up_to_date, 0);

        let task = &outcome.downloads[0];
        assert_eq!(task.params.start, None, "empty disk means full history");
        assert_eq!(task.params.end.as_deref(), Some("20240315"));
    }

    #[test]
    fn test_incremental_range_starts_after_latest() {
        let dir = tempfile::tempdir().unwrap();
        let (planner, store) = planner_with(dir.path(), &["600519.SH"]);
        seed_daily(&store, &[("600519.SH", "20240310")]);

        let outcome = planner.expand("daily", today()).unwrap();
        assert_eq!(outcome.downloads.len(), 1);
        assert_eq!(outcome.downloads[0].params.start.as_deref(), Some("20240311"));
        assert_eq!(outcome.downloads[0].params.end.as_deref(), Some("20240315"));
    }

    #[test]
    fn test_up_to_date_symbol_not_enqueued() {
        let dir = tempfile::tempdir().unwrap();
        let (planner, store) = planner_with(dir.path(), &["600519.SH"]);
        seed_daily(&store, &[("600519.SH", "20240315")]);

        let outcome = planner.expand("daily", today()).unwrap();
        assert!(outcome.downloads.is_empty());
        assert_eq!(outcome.up_to_date, 1);
    }

    #[test]
    fn test_whole_market_dataset_gets_one_task() {
        let dir = tempfile::tempdir().unwrap();
        let (planner, _store) = planner_with(dir.path(), &[]);

        let outcome = planner.expand("basic", today()).unwrap();
        assert_eq!(outcome.downloads.len(), 1);
        assert_eq!(outcome.downloads[0].task_name, "stock_basic");
        assert_eq!(outcome.downloads[0].params, TaskParams::default());
    }

    #[test]
    fn test_universe_from_reference_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let (planner, store) = planner_with(dir.path(), &[]);

        let mut basic = Frame::new(vec!["ts_code".into(), "name".into()]);
        for code in ["600519.SH", "000001.SZ"] {
            basic
                .push_row(vec![Cell::Str(code.into()), Cell::Str("x".into())])
                .unwrap();
        }
        store.persist("stock_basic", &basic).unwrap();

        let outcome = planner.expand("daily", today()).unwrap();
        assert_eq!(outcome.downloads.len(), 2);
        let symbols: Vec<_> = outcome
            .downloads
            .iter()
            .map(|t| t.params.symbol.clone().unwrap())
            .collect();
        assert!(symbols.contains(&"600519.SH".to_string()));
        assert!(symbols.contains(&"000001.SZ".to_string()));
    }

    #[test]
    fn test_empty_universe_skips_dataset_not_plan() {
        let dir = tempfile::tempdir().unwrap();
        let (planner, _store) = planner_with(dir.path(), &[]);

        let outcome = planner.expand("daily", today()).unwrap();
        assert!(outcome.downloads.is_empty());
        assert_eq!(outcome.unit_errors, 1);
    }

    #[test]
    fn test_unknown_group_is_permanent_error() {
        let dir = tempfile::tempdir().unwrap();
        let (planner, _store) = planner_with(dir.path(), &[]);
        let err = planner.expand("nonexistent", today()).unwrap_err();
        assert!(matches!(err, TaskError::Permanent { .. }));
    }

    #[test]
    fn test_malformed_override_symbol_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (planner, _store) = planner_with(dir.path(), &["600519.SH", "bogus"]);
        let outcome = planner.expand("daily", today()).unwrap();
        assert_eq!(outcome.downloads.len(), 1);
    }
}
