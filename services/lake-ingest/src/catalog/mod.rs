//! Dataset catalogue: the declarative description of every table the
//! pipeline knows how to ingest.
//!
//! The catalogue is a TOML file with one `[dataset.<name>]` entry per table
//! plus a `[groups]` map of submission aliases. It is loaded once at startup
//! and read-only afterwards; adding a dataset is one new entry and a restart,
//! no new code.

mod descriptor;

pub use descriptor::{ApiDescriptor, DatasetDescriptor, UpdateStrategy};

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading or querying the catalogue.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("unknown task group: {0}")]
    UnknownGroup(String),

    #[error("catalogue file {path}: {message}")]
    Invalid { path: String, message: String },

    #[error("failed to read catalogue: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw file shape. Unknown fields anywhere are a startup error.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    dataset: BTreeMap<String, DatasetDescriptor>,
    #[serde(default)]
    groups: BTreeMap<String, Vec<String>>,
}

/// The loaded, validated catalogue.
///
/// Immutable after construction; shared across workers behind an `Arc`.
#[derive(Debug)]
pub struct Catalog {
    datasets: BTreeMap<String, DatasetDescriptor>,
    groups: BTreeMap<String, Vec<String>>,
}

impl Catalog {
    /// Load and validate the catalogue from a TOML file.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Parse and validate catalogue text.
    pub fn parse(content: &str, origin: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(content).map_err(|e| CatalogError::Invalid {
            path: origin.to_string(),
            message: e.to_string(),
        })?;

        let catalog = Self {
            datasets: file.dataset,
            groups: file.groups,
        };
        catalog.validate(origin)?;
        Ok(catalog)
    }

    /// Startup validation. Violations are configuration errors.
    fn validate(&self, origin: &str) -> Result<(), CatalogError> {
        let invalid = |message: String| CatalogError::Invalid {
            path: origin.to_string(),
            message,
        };

        for (name, descriptor) in &self.datasets {
            if descriptor.primary_key.is_empty() {
                return Err(invalid(format!("dataset '{name}' has no primary key")));
            }
            if descriptor.update_strategy == UpdateStrategy::Incremental
                && descriptor.date_column.is_none()
            {
                return Err(invalid(format!(
                    "dataset '{name}' uses the incremental strategy but has no date column"
                )));
            }
        }

        // Every group member must resolve.
        for (group, members) in &self.groups {
            if members.is_empty() {
                return Err(invalid(format!("group '{group}' is empty")));
            }
            for member in members {
                if !self.datasets.contains_key(member) {
                    return Err(invalid(format!(
                        "group '{group}' references unknown dataset '{member}'"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Look up a dataset descriptor by task name.
    pub fn get(&self, task_name: &str) -> Result<&DatasetDescriptor, CatalogError> {
        self.datasets
            .get(task_name)
            .ok_or_else(|| CatalogError::UnknownTask(task_name.to_string()))
    }

    /// Resolve a task group to its member dataset names.
    pub fn group(&self, group_name: &str) -> Result<&[String], CatalogError> {
        self.groups
            .get(group_name)
            .map(Vec::as_slice)
            .ok_or_else(|| CatalogError::UnknownGroup(group_name.to_string()))
    }

    /// All dataset names, in catalogue order.
    pub fn dataset_names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    /// All group names.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[dataset.stock_daily]
description = "Daily OHLC bars"
primary_key = ["ts_code", "trade_date"]
date_column = "trade_date"
strategy = "incremental"
per_symbol = true
columns = ["ts_code", "trade_date", "open", "high", "low", "close", "vol", "amount"]

[dataset.stock_daily.api]
method = "daily"

[dataset.stock_basic]
description = "Stock reference list"
primary_key = ["ts_code"]
strategy = "full_replace"
per_symbol = false

[dataset.stock_basic.api]
method = "stock_basic"
[dataset.stock_basic.api.default_params]
list_status = "L"

[groups]
daily = ["stock_daily"]
basic = ["stock_basic"]
all = ["stock_basic", "stock_daily"]
"#;

    #[test]
    fn test_parse_and_lookup() {
        let catalog = Catalog::parse(SAMPLE, "test").unwrap();

        let daily = catalog.get("stock_daily").unwrap();
        assert_eq!(daily.primary_key, vec!["ts_code", "trade_date"]);
        assert_eq!(daily.date_column.as_deref(), Some("trade_date"));
        assert_eq!(daily.update_strategy, UpdateStrategy::Incremental);
        assert!(daily.per_symbol);
        assert_eq!(daily.api.method, "daily");

        let basic = catalog.get("stock_basic").unwrap();
        assert_eq!(basic.update_strategy, UpdateStrategy::FullReplace);
        assert!(!basic.per_symbol);
        assert_eq!(
            basic.api.default_params.get("list_status").map(String::as_str),
            Some("L")
        );
    }

    #[test]
    fn test_unknown_task() {
        let catalog = Catalog::parse(SAMPLE, "test").unwrap();
        assert!(matches!(
            catalog.get("nonexistent"),
            Err(CatalogError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_groups_resolve() {
        let catalog = Catalog::parse(SAMPLE, "test").unwrap();
        assert_eq!(catalog.group("all").unwrap().len(), 2);
        assert!(matches!(
            catalog.group("nope"),
            Err(CatalogError::UnknownGroup(_))
        ));
        // Invariant: every group member resolves via get()
        for group in catalog.group_names().collect::<Vec<_>>() {
            for member in catalog.group(group).unwrap() {
                assert!(catalog.get(member).is_ok());
            }
        }
    }

    #[test]
    fn test_group_with_unknown_member_rejected() {
        let bad = r#"
[dataset.a]
primary_key = ["k"]
strategy = "full_replace"
per_symbol = false
[dataset.a.api]
method = "a"

[groups]
g = ["a", "missing"]
"#;
        assert!(matches!(
            Catalog::parse(bad, "test"),
            Err(CatalogError::Invalid { .. })
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let bad = r#"
[dataset.a]
primary_key = ["k"]
strategy = "full_replace"
per_symbol = false
surprise = true
[dataset.a.api]
method = "a"
"#;
        assert!(Catalog::parse(bad, "test").is_err());
    }

    #[test]
    fn test_incremental_requires_date_column() {
        let bad = r#"
[dataset.a]
primary_key = ["k"]
strategy = "incremental"
per_symbol = false
[dataset.a.api]
method = "a"
"#;
        assert!(matches!(
            Catalog::parse(bad, "test"),
            Err(CatalogError::Invalid { .. })
        ));
    }

    #[test]
    fn test_missing_primary_key_rejected() {
        let bad = r#"
[dataset.a]
primary_key = []
strategy = "full_replace"
per_symbol = false
[dataset.a.api]
method = "a"
"#;
        assert!(Catalog::parse(bad, "test").is_err());
    }
}
