//! Logical index of the lake's partition files.
//!
//! The manifest answers "which files exist, in which year partition, for
//! which dataset" for the planner and for external analytical readers. It is
//! rebuilt from the directory tree on demand and is never the source of
//! truth for row data; a stale or missing snapshot is always recoverable.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::layout::LakeLayout;

/// One published partition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub dataset: String,
    /// Year partition, `None` for flat reference-table files
    pub year: Option<i32>,
    pub file_name: String,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

/// Snapshot of the lake's file tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build a manifest by scanning the lake root.
    pub fn scan(layout: &LakeLayout) -> Result<Self> {
        let mut files = Vec::new();

        let root_entries = match fs::read_dir(layout.root()) {
            Ok(entries) => entries,
            // An absent root is an empty lake.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    generated_at: Utc::now(),
                    files,
                })
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read lake root {}", layout.root().display()))
            }
        };

        for entry in root_entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !entry.path().is_dir()
                || LakeLayout::is_swap_leftover(&name)
                || name.starts_with('.')
                || name.starts_with('_')
            {
                continue;
            }
            scan_dataset(&entry.path(), &name, &mut files)?;
        }

        files.sort_by(|a, b| {
            (&a.dataset, a.year, &a.file_name).cmp(&(&b.dataset, b.year, &b.file_name))
        });

        Ok(Self {
            generated_at: Utc::now(),
            files,
        })
    }

    /// Datasets that currently have at least one file.
    pub fn datasets(&self) -> BTreeSet<&str> {
        self.files.iter().map(|f| f.dataset.as_str()).collect()
    }

    /// Entries belonging to one dataset.
    pub fn files_for<'a>(&'a self, dataset: &'a str) -> impl Iterator<Item = &'a ManifestEntry> {
        self.files.iter().filter(move |f| f.dataset == dataset)
    }

    /// Years present for a dataset.
    pub fn years_for(&self, dataset: &str) -> BTreeSet<i32> {
        self.files_for(dataset).filter_map(|f| f.year).collect()
    }

    /// Write the snapshot next to the data, via temp-then-rename.
    pub fn write_snapshot(&self, layout: &LakeLayout) -> Result<PathBuf> {
        fs::create_dir_all(layout.root())?;
        let final_path = layout.manifest_path();
        let tmp_path = layout.root().join(".tmp-manifest.json");

        let json = serde_json::to_vec_pretty(self).context("serialize manifest")?;
        fs::write(&tmp_path, json)
            .with_context(|| format!("write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("publish {}", final_path.display()))?;
        Ok(final_path)
    }
}

fn scan_dataset(dir: &Path, dataset: &str, files: &mut Vec<ManifestEntry>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        if path.is_dir() {
            if let Some(year) = LakeLayout::parse_year_dir(&name) {
                scan_year(&path, dataset, year, files)?;
            }
        } else if LakeLayout::is_partition_file(&name) {
            files.push(entry_for(&entry, dataset, None, name)?);
        }
    }
    Ok(())
}

fn scan_year(dir: &Path, dataset: &str, year: i32, files: &mut Vec<ManifestEntry>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.path().is_file() && LakeLayout::is_partition_file(&name) {
            files.push(entry_for(&entry, dataset, Some(year), name)?);
        }
    }
    Ok(())
}

fn entry_for(
    entry: &fs::DirEntry,
    dataset: &str,
    year: Option<i32>,
    file_name: String,
) -> Result<ManifestEntry> {
    let metadata = entry.metadata()?;
    let modified: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    Ok(ManifestEntry {
        dataset: dataset.to_string(),
        year,
        file_name,
        size_bytes: metadata.len(),
        modified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Cell, Frame};
    use crate::store::writer;

    fn seed_lake(layout: &LakeLayout) {
        let mut daily = Frame::new(vec!["ts_code".into(), "trade_date".into()]);
        daily
            .push_row(vec![Cell::Str("600519.SH".into()), Cell::Str("20231229".into())])
            .unwrap();
        daily
            .push_row(vec![Cell::Str("600519.SH".into()), Cell::Str("20240102".into())])
            .unwrap();
        writer::append(layout, "stock_daily", "trade_date", &daily).unwrap();

        let mut basic = Frame::new(vec!["ts_code".into()]);
        basic.push_row(vec![Cell::Str("600519.SH".into())]).unwrap();
        writer::replace(layout, "stock_basic", None, &basic).unwrap();
    }

    #[test]
    fn test_scan_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(dir.path().join("does-not-exist"));
        let manifest = Manifest::scan(&layout).unwrap();
        assert!(manifest.files.is_empty());
    }

    #[test]
    fn test_scan_finds_year_and_flat_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(dir.path());
        seed_lake(&layout);

        let manifest = Manifest::scan(&layout).unwrap();
        assert_eq!(manifest.datasets().len(), 2);
        assert_eq!(manifest.years_for("stock_daily"), [2023, 2024].into());
        assert_eq!(manifest.files_for("stock_basic").count(), 1);
        assert_eq!(
            manifest
                .files_for("stock_basic")
                .next()
                .unwrap()
                .year,
            None
        );
    }

    #[test]
    fn test_scan_ignores_swap_leftovers_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(dir.path());
        seed_lake(&layout);
        fs::create_dir_all(dir.path().join(".old-stock_basic-xyz")).unwrap();
        fs::create_dir_all(dir.path().join(".staging-stock_basic-xyz")).unwrap();
        fs::write(layout.manifest_path(), b"{}").unwrap();

        let manifest = Manifest::scan(&layout).unwrap();
        assert_eq!(manifest.datasets().len(), 2);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LakeLayout::new(dir.path());
        seed_lake(&layout);

        let manifest = Manifest::scan(&layout).unwrap();
        let path = manifest.write_snapshot(&layout).unwrap();
        let loaded: Manifest =
            serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert_eq!(loaded.files.len(), manifest.files.len());
    }
}
