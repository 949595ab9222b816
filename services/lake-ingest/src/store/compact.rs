//! Partition compaction.
//!
//! Incremental appends accumulate many small files per year partition, and
//! later files may overlap earlier ones on primary key. Compaction merges a
//! partition into a single file, deduplicating by primary key with the
//! newest file winning, and sorts rows by key. Runs only on the maintenance
//! queue; the merged file is published temp-then-rename before the inputs
//! are deleted, so readers never observe a gap.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::convert::read_parquet_file;
use super::layout::LakeLayout;
use super::writer::write_batch_atomic;
use crate::frame::{Cell, Frame};

/// Result of compacting one dataset.
#[derive(Debug, Default)]
pub struct CompactOutcome {
    /// Partitions that were merged
    pub partitions: usize,
    /// Input files deleted after merging
    pub files_removed: usize,
    /// Rows across merged partitions before deduplication
    pub rows_before: usize,
    /// Rows after deduplication
    pub rows_after: usize,
}

/// Compact every multi-file year partition of a dataset.
pub fn compact(layout: &LakeLayout, dataset: &str, primary_key: &[String]) -> Result<CompactOutcome> {
    let mut outcome = CompactOutcome::default();
    let dataset_dir = layout.dataset_dir(dataset);
    if !dataset_dir.exists() {
        return Ok(outcome);
    }

    let mut year_dirs: Vec<PathBuf> = fs::read_dir(&dataset_dir)
        .with_context(|| format!("read {}", dataset_dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path().is_dir()
                && LakeLayout::parse_year_dir(&e.file_name().to_string_lossy()).is_some()
        })
        .map(|e| e.path())
        .collect();
    year_dirs.sort();

    for year_dir in year_dirs {
        compact_partition(&year_dir, dataset, primary_key, &mut outcome)?;
    }

    if outcome.partitions > 0 {
        info!(
            dataset,
            partitions = outcome.partitions,
            removed = outcome.files_removed,
            rows_before = outcome.rows_before,
            rows_after = outcome.rows_after,
            "Compacted dataset"
        );
    }
    Ok(outcome)
}

fn compact_partition(
    dir: &Path,
    dataset: &str,
    primary_key: &[String],
    outcome: &mut CompactOutcome,
) -> Result<()> {
    // Part names start with a UTC timestamp, so name order is write order.
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path().is_file()
                && LakeLayout::is_partition_file(&e.file_name().to_string_lossy())
        })
        .map(|e| e.path())
        .collect();
    files.sort();

    if files.len() < 2 {
        return Ok(());
    }

    let mut columns: Vec<String> = Vec::new();
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, Vec<Cell>> = HashMap::new();
    let mut rows_before = 0usize;

    for path in &files {
        let frame = read_parquet_file(path)?;
        rows_before += frame.len();

        // Union of columns across files; missing cells become nulls.
        for name in frame.columns() {
            if !columns.contains(name) {
                columns.push(name.clone());
            }
        }

        let key_indices: Vec<usize> = primary_key
            .iter()
            .map(|k| frame.column_index(k))
            .collect::<Result<_, _>>()
            .with_context(|| format!("primary key column missing in {}", path.display()))?;

        for row in frame.rows() {
            let key = key_indices
                .iter()
                .map(|&i| render_key(&row[i]))
                .collect::<Vec<_>>()
                .join("\u{1f}");

            let mut widened = vec![Cell::Null; columns.len()];
            for (idx, name) in frame.columns().iter().enumerate() {
                let target = columns.iter().position(|c| c == name).expect("union column");
                widened[target] = row[idx].clone();
            }

            if !merged.contains_key(&key) {
                order.push(key.clone());
            }
            // Later files overwrite earlier ones: newest wins.
            merged.insert(key, widened);
        }
    }

    order.sort();
    let mut compacted = Frame::new(columns);
    for key in &order {
        compacted
            .push_row(merged.remove(key).expect("ordered key present"))
            .context("merged row width")?;
    }

    let batch = super::convert::frame_to_batch(&compacted)?;
    let new_file = write_batch_atomic(dir, &LakeLayout::unique_part_name(), &batch)?;
    debug!(dataset, file = %new_file.display(), "Published compacted partition file");

    for path in &files {
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
        outcome.files_removed += 1;
    }

    outcome.partitions += 1;
    outcome.rows_before += rows_before;
    outcome.rows_after += compacted.len();
    Ok(())
}

fn render_key(cell: &Cell) -> String {
    match cell {
        Cell::Null => String::new(),
        Cell::Int(v) => v.to_string(),
        Cell::Float(v) => v.to_string(),
        Cell::Str(s) => s.clone(),
    }
}
