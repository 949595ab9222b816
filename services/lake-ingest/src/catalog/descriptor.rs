//! Dataset descriptor types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a persist task writes a dataset to the lake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// Write new partition files next to the existing ones; never mutate.
    Incremental,
    /// Rewrite the whole dataset into a staging tree and swap atomically.
    FullReplace,
}

/// The vendor call a dataset maps to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiDescriptor {
    /// Vendor method name (e.g. `daily`, `stock_basic`)
    pub method: String,
    /// Fixed parameters sent with every call
    #[serde(default)]
    pub default_params: BTreeMap<String, String>,
}

/// One catalogue entry: everything the pipeline needs to plan, fetch and
/// persist a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetDescriptor {
    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Ordered column set uniquely identifying a logical row
    pub primary_key: Vec<String>,

    /// Column whose max drives incremental planning; absent for reference tables
    #[serde(default)]
    pub date_column: Option<String>,

    /// Vendor API mapping
    pub api: ApiDescriptor,

    /// Columns the vendor response must contain; empty accepts any shape
    #[serde(default)]
    pub columns: Vec<String>,

    /// Persistence strategy
    #[serde(rename = "strategy")]
    pub update_strategy: UpdateStrategy,

    /// Whether the planner expands this dataset per symbol
    pub per_symbol: bool,
}

impl DatasetDescriptor {
    /// Whether the vendor response shape is pinned by the catalogue.
    pub fn has_declared_columns(&self) -> bool {
        !self.columns.is_empty()
    }
}
