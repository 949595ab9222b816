//! Parquet writing with the two persistence strategies.
//!
//! Every file reaches its published name the same way: write to a hidden
//! `.tmp-` sibling in the destination directory, fsync, rename. A file that
//! is visible under its final name is complete; a crash leaves at most a
//! `.tmp-` orphan that the manifest ignores and maintenance sweeps.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use tracing::{debug, warn};

use super::convert::frame_to_batch;
use super::layout::LakeLayout;
use crate::frame::Frame;

/// Result of an append.
#[derive(Debug, Default)]
pub struct AppendOutcome {
    /// Files published, one per touched year partition
    pub files: Vec<PathBuf>,
    /// Rows written
    pub rows: usize,
}

/// Result of a full replace.
#[derive(Debug)]
pub struct ReplaceOutcome {
    /// Rows in the new tree
    pub rows: usize,
    /// Pre-swap tree left behind for the maintenance sweep, if the
    /// best-effort delete did not finish
    pub leftover: Option<PathBuf>,
}

fn writer_properties() -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some("lake-ingest".to_string()),
    };
    WriterProperties::builder()
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

/// Write one batch as `<dir>/<final_name>` via temp-then-rename.
pub fn write_batch_atomic(dir: &Path, final_name: &str, batch: &RecordBatch) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let tmp_path = dir.join(LakeLayout::temp_name(final_name));
    let final_path = dir.join(final_name);

    let write = || -> Result<()> {
        let file = File::create(&tmp_path)
            .with_context(|| format!("create temp file {}", tmp_path.display()))?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(writer_properties()))
            .context("open parquet writer")?;
        writer.write(batch).context("write parquet batch")?;
        let file = writer.into_inner().context("finish parquet file")?;
        file.sync_all().context("fsync parquet file")?;
        fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("publish {}", final_path.display()))?;
        Ok(())
    };

    if let Err(err) = write() {
        // No partial file may stay visible; the temp is ours to remove.
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }

    Ok(final_path)
}

/// Append a frame to a dataset: new files into year partitions, nothing
/// mutated. Not idempotent — re-appending the same rows duplicates them, and
/// readers that need uniqueness deduplicate by primary key.
pub fn append(layout: &LakeLayout, dataset: &str, date_column: &str, frame: &Frame) -> Result<AppendOutcome> {
    if frame.is_empty() {
        debug!(dataset, "Empty payload, append is a no-op");
        return Ok(AppendOutcome::default());
    }

    let (parts, unparseable) = frame
        .partition_by_year(date_column)
        .with_context(|| format!("partition {dataset} by {date_column}"))?;
    if unparseable > 0 {
        warn!(dataset, rows = unparseable, "Dropped rows with unparseable dates");
    }

    let mut outcome = AppendOutcome::default();
    for (year, part) in &parts {
        let batch = frame_to_batch(part)?;
        let dir = layout.year_dir(dataset, *year);
        let path = write_batch_atomic(&dir, &LakeLayout::unique_part_name(), &batch)?;
        debug!(dataset, year, rows = part.len(), file = %path.display(), "Published partition file");
        outcome.files.push(path);
        outcome.rows += part.len();
    }

    Ok(outcome)
}

/// Replace a dataset's full contents.
///
/// The new tree is built under a sibling staging directory, then swapped in
/// by renaming the live tree aside and the staging tree into place. A reader
/// listing the dataset sees the old tree or the new tree, never a mixture;
/// a reader holding open file handles keeps reading what it opened.
pub fn replace(
    layout: &LakeLayout,
    dataset: &str,
    date_column: Option<&str>,
    frame: &Frame,
) -> Result<ReplaceOutcome> {
    let staging = layout.staging_dir(dataset);

    let build = || -> Result<usize> {
        fs::create_dir_all(&staging)
            .with_context(|| format!("create staging {}", staging.display()))?;

        if frame.is_empty() {
            return Ok(0);
        }

        match date_column {
            Some(column) => {
                let (parts, unparseable) = frame.partition_by_year(column)?;
                if unparseable > 0 {
                    warn!(dataset, rows = unparseable, "Dropped rows with unparseable dates");
                }
                let mut rows = 0;
                for (year, part) in &parts {
                    let batch = frame_to_batch(part)?;
                    let dir = staging.join(format!("year={year:04}"));
                    write_batch_atomic(&dir, &LakeLayout::unique_part_name(), &batch)?;
                    rows += part.len();
                }
                Ok(rows)
            }
            None => {
                let batch = frame_to_batch(frame)?;
                write_batch_atomic(&staging, &LakeLayout::unique_data_name(), &batch)?;
                Ok(frame.len())
            }
        }
    };

    let rows = match build() {
        Ok(rows) => rows,
        Err(err) => {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }
    };

    // Swap. Both renames stay on one mount, so each is atomic; the SLOW
    // queue's single worker serializes replaces of the same dataset.
    let live = layout.dataset_dir(dataset);
    let old = layout.old_dir(dataset);
    let had_previous = live.exists();
    if had_previous {
        fs::rename(&live, &old).with_context(|| format!("retire {}", live.display()))?;
    }
    if let Err(err) = fs::rename(&staging, &live) {
        // Roll the old tree back so the dataset never stays missing.
        if had_previous {
            let _ = fs::rename(&old, &live);
        }
        let _ = fs::remove_dir_all(&staging);
        return Err(err).with_context(|| format!("publish {}", live.display()));
    }

    let leftover = if had_previous {
        match fs::remove_dir_all(&old) {
            Ok(()) => None,
            Err(_) => Some(old),
        }
    } else {
        None
    };

    debug!(dataset, rows, "Replaced dataset contents");
    Ok(ReplaceOutcome { rows, leftover })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Cell;

    fn daily_frame(dates: &[&str]) -> Frame {
        let mut frame = Frame::new(vec![
            "ts_code".into(),
            "trade_date".into(),
            "close".into(),
        ]);
        for date in dates {
            frame
                .push_row(vec![
                    Cell::Str("600519.SH".into()),
                    Cell::Str((*date).into()),
                    Cell::Float(1700.0),
                ])
                .unwrap();
        }
        frame
    }

    #[test]
    fn test_append_partitions_by_year() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(dir.path());

        let frame = daily_frame(&["20231229", "20240102", "20240103"]);
        let outcome = append(&layout, "stock_daily", "trade_date", &frame).unwrap();

        assert_eq!(outcome.rows, 3);
        assert_eq!(outcome.files.len(), 2);
        assert!(layout.year_dir("stock_daily", 2023).exists());
        assert!(layout.year_dir("stock_daily", 2024).exists());
    }

    #[test]
    fn test_append_empty_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(dir.path());

        let outcome = append(
            &layout,
            "stock_daily",
            "trade_date",
            &Frame::new(vec!["trade_date".into()]),
        )
        .unwrap();
        assert_eq!(outcome.rows, 0);
        assert!(!layout.dataset_dir("stock_daily").exists());
    }

    #[test]
    fn test_append_never_mutates_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(dir.path());

        let first = append(&layout, "stock_daily", "trade_date", &daily_frame(&["20240102"])).unwrap();
        let before = fs::read(&first.files[0]).unwrap();

        append(&layout, "stock_daily", "trade_date", &daily_frame(&["20240103"])).unwrap();

        let after = fs::read(&first.files[0]).unwrap();
        assert_eq!(before, after);

        // Two files now coexist in the partition
        let entries: Vec<_> = fs::read_dir(layout.year_dir("stock_daily", 2024))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_replace_swaps_whole_tree() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(dir.path());

        let mut ref_frame = Frame::new(vec!["ts_code".into(), "name".into()]);
        ref_frame
            .push_row(vec![Cell::Str("600519.SH".into()), Cell::Str("Moutai".into())])
            .unwrap();
        let outcome = replace(&layout, "stock_basic", None, &ref_frame).unwrap();
        assert_eq!(outcome.rows, 1);
        assert!(outcome.leftover.is_none());

        let first_files: Vec<_> = fs::read_dir(layout.dataset_dir("stock_basic"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(first_files.len(), 1);

        // Replace again; the old file is gone, a new one is there.
        let outcome = replace(&layout, "stock_basic", None, &ref_frame).unwrap();
        assert_eq!(outcome.rows, 1);
        let second_files: Vec<_> = fs::read_dir(layout.dataset_dir("stock_basic"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(second_files.len(), 1);
        assert_ne!(first_files[0], second_files[0]);

        // No swap siblings left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| LakeLayout::is_swap_leftover(n))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn test_replace_with_date_column_builds_year_tree() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(dir.path());

        let frame = daily_frame(&["20231229", "20240102"]);
        replace(&layout, "trade_cal", Some("trade_date"), &frame).unwrap();

        assert!(layout.year_dir("trade_cal", 2023).exists());
        assert!(layout.year_dir("trade_cal", 2024).exists());
    }

    #[test]
    fn test_replace_empty_frame_empties_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(dir.path());

        replace(&layout, "stock_basic", None, &{
            let mut f = Frame::new(vec!["ts_code".into()]);
            f.push_row(vec![Cell::Str("600519.SH".into())]).unwrap();
            f
        })
        .unwrap();

        replace(&layout, "stock_basic", None, &Frame::new(vec!["ts_code".into()])).unwrap();
        let entries: Vec<_> = fs::read_dir(layout.dataset_dir("stock_basic"))
            .unwrap()
            .collect();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_no_temp_files_survive_publication() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(dir.path());
        append(&layout, "stock_daily", "trade_date", &daily_frame(&["20240102"])).unwrap();

        let names: Vec<String> = fs::read_dir(layout.year_dir("stock_daily", 2024))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| LakeLayout::is_partition_file(n)), "{names:?}");
    }
}
