//! Metadata reads over the lake via the embedded analytical engine.
//!
//! The lake's files are plain hive-partitioned parquet, so "what is the
//! latest date on disk for (dataset, symbol)" is one aggregate query over a
//! glob. Queries always start from a fresh directory scan: a file that has
//! just been published is visible to the next call, and a dataset with no
//! files short-circuits to "none" without touching the engine.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use duckdb::Connection;
use std::fs;
use std::path::Path;

use super::layout::LakeLayout;
use crate::dates;

/// Read-only metadata queries against the lake.
#[derive(Debug)]
pub struct MetaReader {
    layout: LakeLayout,
}

impl MetaReader {
    pub fn new(layout: LakeLayout) -> Self {
        Self { layout }
    }

    /// Whether the dataset has any published partition file on disk.
    pub fn has_files(&self, dataset: &str) -> bool {
        fn scan(dir: &Path) -> bool {
            let Ok(entries) = fs::read_dir(dir) else {
                return false;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                if path.is_dir() {
                    if scan(&path) {
                        return true;
                    }
                } else if LakeLayout::is_partition_file(&name) {
                    return true;
                }
            }
            false
        }
        scan(&self.layout.dataset_dir(dataset))
    }

    /// Latest value of `date_column` physically on disk, optionally filtered
    /// to one symbol. `None` means no rows exist and full history is needed.
    pub fn latest_date(
        &self,
        dataset: &str,
        date_column: &str,
        symbol_filter: Option<(&str, &str)>,
    ) -> Result<Option<NaiveDate>> {
        if !self.has_files(dataset) {
            return Ok(None);
        }

        let conn = self.connection()?;
        let glob = sql_str(&self.layout.dataset_glob(dataset));

        let max: Option<String> = match symbol_filter {
            Some((column, value)) => {
                let sql = format!(
                    "SELECT CAST(max({date}) AS VARCHAR) FROM read_parquet({glob}, union_by_name=true) WHERE {sym} = ?",
                    date = ident(date_column),
                    sym = ident(column),
                );
                conn.query_row(&sql, [value], |row| row.get(0))
            }
            None => {
                let sql = format!(
                    "SELECT CAST(max({date}) AS VARCHAR) FROM read_parquet({glob}, union_by_name=true)",
                    date = ident(date_column),
                );
                conn.query_row(&sql, [], |row| row.get(0))
            }
        }
        .with_context(|| format!("query max({date_column}) of {dataset}"))?;

        Ok(max.as_deref().and_then(dates::parse_compact))
    }

    /// Distinct values of a column, sorted. Used for the symbol universe.
    pub fn distinct_strings(&self, dataset: &str, column: &str) -> Result<Vec<String>> {
        if !self.has_files(dataset) {
            return Ok(Vec::new());
        }

        let conn = self.connection()?;
        let sql = format!(
            "SELECT DISTINCT CAST({col} AS VARCHAR) AS v FROM read_parquet({glob}, union_by_name=true) WHERE {col} IS NOT NULL ORDER BY v",
            col = ident(column),
            glob = sql_str(&self.layout.dataset_glob(dataset)),
        );

        let mut stmt = conn
            .prepare(&sql)
            .with_context(|| format!("prepare distinct {column} of {dataset}"))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .with_context(|| format!("query distinct {column} of {dataset}"))?;

        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }

    /// Total row count of a dataset.
    pub fn count_rows(&self, dataset: &str) -> Result<u64> {
        if !self.has_files(dataset) {
            return Ok(0);
        }

        let conn = self.connection()?;
        let sql = format!(
            "SELECT count(*) FROM read_parquet({glob}, union_by_name=true)",
            glob = sql_str(&self.layout.dataset_glob(dataset)),
        );
        let count: i64 = conn
            .query_row(&sql, [], |row| row.get(0))
            .with_context(|| format!("count rows of {dataset}"))?;
        Ok(count.max(0) as u64)
    }

    fn connection(&self) -> Result<Connection> {
        Connection::open_in_memory().context("open analytical engine")
    }
}

/// Quote an identifier from the catalogue.
fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal (paths, globs).
fn sql_str(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
