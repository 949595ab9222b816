//! On-disk layout of the parquet lake.
//!
//! ```text
//! <root>/<dataset>/year=<YYYY>/part-<stamp>-<rand>.parquet   dated datasets
//! <root>/<dataset>/data-<stamp>-<rand>.parquet               reference tables
//! <root>/.staging-<dataset>-<uuid>/...                       replace staging
//! <root>/.old-<dataset>-<uuid>/...                           pre-swap tree
//! <root>/_manifest.json                                      manifest snapshot
//! ```
//!
//! Part names embed a UTC timestamp plus a random suffix so concurrent
//! appends can never collide; files are immutable once renamed into place.

use chrono::Utc;
use rand::Rng;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File name of the manifest snapshot at the lake root.
pub const MANIFEST_FILE: &str = "_manifest.json";

/// Path builder for the lake.
#[derive(Debug, Clone)]
pub struct LakeLayout {
    root: PathBuf,
}

impl LakeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_dir(&self, dataset: &str) -> PathBuf {
        self.root.join(dataset)
    }

    pub fn year_dir(&self, dataset: &str, year: i32) -> PathBuf {
        self.dataset_dir(dataset).join(format!("year={year:04}"))
    }

    /// Sibling staging tree for a full replace.
    pub fn staging_dir(&self, dataset: &str) -> PathBuf {
        self.root
            .join(format!(".staging-{dataset}-{}", Uuid::new_v4()))
    }

    /// Sibling holding the pre-swap tree until maintenance sweeps it.
    pub fn old_dir(&self, dataset: &str) -> PathBuf {
        self.root.join(format!(".old-{dataset}-{}", Uuid::new_v4()))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Glob covering every partition file of a dataset, for the query engine.
    pub fn dataset_glob(&self, dataset: &str) -> String {
        format!("{}/**/*.parquet", self.dataset_dir(dataset).display())
    }

    /// Unique name for an appended partition file.
    pub fn unique_part_name() -> String {
        format!("part-{}.parquet", Self::unique_suffix())
    }

    /// Unique name for a reference-table data file.
    pub fn unique_data_name() -> String {
        format!("data-{}.parquet", Self::unique_suffix())
    }

    /// Hidden sibling a file is written to before its publishing rename.
    pub fn temp_name(final_name: &str) -> String {
        format!(".tmp-{final_name}")
    }

    fn unique_suffix() -> String {
        let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
        let mut rng = rand::thread_rng();
        let rand: String = (0..6)
            .map(|_| {
                let chars = b"abcdefghijklmnopqrstuvwxyz0123456789";
                chars[rng.gen_range(0..chars.len())] as char
            })
            .collect();
        format!("{stamp}-{rand}")
    }

    /// Whether a directory entry is a published partition file.
    pub fn is_partition_file(name: &str) -> bool {
        name.ends_with(".parquet") && !name.starts_with('.')
    }

    /// Whether a root entry is a leftover swap sibling.
    pub fn is_swap_leftover(name: &str) -> bool {
        name.starts_with(".old-") || name.starts_with(".staging-")
    }

    /// Parse the year out of a `year=YYYY` directory name.
    pub fn parse_year_dir(name: &str) -> Option<i32> {
        name.strip_prefix("year=")?.parse().ok()
    }
}
