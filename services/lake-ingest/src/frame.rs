//! Tabular payload carried from a download task to its paired persist task.
//!
//! A `Frame` is a column-name header plus row-major cells, exactly the shape
//! the vendor returns (`fields` + `items`). It serializes with serde so the
//! queue store can carry it by value; no in-process handles ever cross a
//! queue boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::dates;

/// One cell of a frame. The vendor speaks JSON, so cells are the JSON
/// scalar types; anything richer is a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
}

impl Cell {
    /// String view of the cell, when it holds one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Convert a JSON scalar into a cell. Arrays/objects are stringified.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Int(i64::from(b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::Str(s),
            other => Self::Str(other.to_string()),
        }
    }
}

/// Errors raised while shaping a frame.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("row {row} has {got} cells, expected {expected}")]
    RaggedRow {
        row: usize,
        got: usize,
        expected: usize,
    },

    #[error("no such column: {0}")]
    NoSuchColumn(String),
}

/// A row set with a declared column header.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Frame {
    /// An empty frame with the given header.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a frame from the vendor's `fields` + `items` representation.
    pub fn from_vendor(
        fields: Vec<String>,
        items: Vec<Vec<serde_json::Value>>,
    ) -> Result<Self, FrameError> {
        let width = fields.len();
        let mut frame = Self::new(fields);
        for (idx, item) in items.into_iter().enumerate() {
            if item.len() != width {
                return Err(FrameError::RaggedRow {
                    row: idx,
                    got: item.len(),
                    expected: width,
                });
            }
            frame.rows.push(item.into_iter().map(Cell::from_json).collect());
        }
        Ok(frame)
    }

    /// Append a row. Width must match the header.
    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), FrameError> {
        if row.len() != self.columns.len() {
            return Err(FrameError::RaggedRow {
                row: self.rows.len(),
                got: row.len(),
                expected: self.columns.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a named column.
    pub fn column_index(&self, name: &str) -> Result<usize, FrameError> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| FrameError::NoSuchColumn(name.to_string()))
    }

    /// Whether every name in `expected` appears in the header.
    pub fn missing_columns<'a>(&self, expected: &'a [String]) -> Vec<&'a str> {
        expected
            .iter()
            .filter(|name| !self.columns.iter().any(|c| &c == name))
            .map(String::as_str)
            .collect()
    }

    /// Max string value of a column, ignoring nulls and non-strings.
    ///
    /// Compact dates are fixed-width, so this is the latest date when called
    /// on a date column.
    pub fn max_str(&self, column: &str) -> Result<Option<&str>, FrameError> {
        let idx = self.column_index(column)?;
        Ok(self
            .rows
            .iter()
            .filter_map(|row| row[idx].as_str())
            .max())
    }

    /// Split rows by the year of a compact-date column.
    ///
    /// Rows whose date cell does not parse are grouped under `None` so the
    /// caller can decide whether to drop or report them.
    pub fn partition_by_year(
        &self,
        date_column: &str,
    ) -> Result<(BTreeMap<i32, Frame>, usize), FrameError> {
        let idx = self.column_index(date_column)?;
        let mut parts: BTreeMap<i32, Frame> = BTreeMap::new();
        let mut unparseable = 0usize;

        for row in &self.rows {
            let year = row[idx].as_str().and_then(dates::year_of_compact);
            match year {
                Some(year) => {
                    parts
                        .entry(year)
                        .or_insert_with(|| Frame::new(self.columns.clone()))
                        .rows
                        .push(row.clone());
                }
                None => unparseable += 1,
            }
        }

        Ok((parts, unparseable))
    }
}
