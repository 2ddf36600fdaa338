//! Indexing: root-overlap checks plus the filesystem walk that seeds the
//! catalog with `(path, size, ctime, allowed)` rows.

use crate::{DifEngine, EngineError};
use core_config::{Config, ConfigError, Progress, THUMB_DIR};
use core_store::FileEntry;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Rows buffered in memory before a bulk insert.
const INDEX_BATCH: usize = 1000;

fn normalize(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Whether two roots collide: identical paths always do, prefix pairs only
/// matter when the walk recurses into them.
fn roots_overlap(a: &Path, b: &Path, recurse: bool) -> bool {
    let a = normalize(a);
    let b = normalize(b);
    if a == b {
        return true;
    }
    recurse && (a.starts_with(&b) || b.starts_with(&a))
}

/// Reject overlapping roots within and across the two partitions.
pub fn check_directories(config: &Config) -> Result<(), ConfigError> {
    let roots: Vec<&PathBuf> = config.part_a.iter().chain(config.part_b.iter()).collect();
    for (i, a) in roots.iter().enumerate() {
        for b in roots.iter().skip(i + 1) {
            if roots_overlap(a, b, config.recurse) {
                return Err(ConfigError::OverlappingRoots {
                    parent: (*a).clone(),
                    child: (*b).clone(),
                });
            }
        }
    }
    Ok(())
}

fn keep_entry(config: &Config, entry: &walkdir::DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    if entry.file_type().is_dir() && name.starts_with(THUMB_DIR) {
        return false;
    }
    if config.ignore_names.iter().any(|n| n.as_str() == name) {
        return false;
    }
    if config.ignore_paths.iter().any(|p| p == entry.path()) {
        return false;
    }
    true
}

fn timestamp_secs(meta: &std::fs::Metadata) -> f64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(-1.0)
}

impl DifEngine {
    /// Walk one root and insert its files. Unreadable entries are logged
    /// and skipped; they never fail the index.
    fn index_root(&mut self, root: &Path, part_b: bool, dir_index: i64) -> Result<usize, EngineError> {
        let root = normalize(root);
        info!(target: "engine", root = %root.display(), part_b, "indexing_root");

        let mut walk = WalkDir::new(&root).follow_links(false);
        if !self.config().recurse {
            walk = walk.max_depth(1);
        }

        let mut batch: Vec<FileEntry> = Vec::with_capacity(INDEX_BATCH);
        let mut total = 0usize;
        let config = self.config().clone();
        for entry in walk.into_iter().filter_entry(|e| keep_entry(&config, e)) {
            if !self.running() {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(target: "engine", error = %err, "walk_entry_unreadable");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(target: "engine", path = %entry.path().display(), error = %err, "stat_failed");
                    continue;
                }
            };
            batch.push(FileEntry {
                allowed: config.extension_allowed(entry.path()),
                size: meta.len() as i64,
                created: timestamp_secs(&meta),
                path: entry.into_path(),
            });
            if batch.len() >= INDEX_BATCH {
                total += batch.len();
                self.store_mut().bulk_insert_files(&batch, part_b, dir_index)?;
                debug!(target: "engine", total, "index_progress");
                batch.clear();
            }
        }
        total += batch.len();
        self.store_mut().bulk_insert_files(&batch, part_b, dir_index)?;
        Ok(total)
    }

    /// Index both partitions and compact the catalog into its dense key
    /// layout.
    pub fn full_index(&mut self) -> Result<(), EngineError> {
        check_directories(self.config())?;

        // A restart mid-index starts the table over.
        if self.store_ref().directory_table_exists()? {
            info!(target: "engine", "purging_preexisting_directory_table");
            self.store_ref().drop_directory_table()?;
        }
        self.store_ref().create_directory_table()?;

        let part_a = self.config().part_a.clone();
        let part_b = self.config().part_b.clone();
        let mut indexed = 0usize;
        for (dir_index, root) in part_a.iter().chain(part_b.iter()).enumerate() {
            if !self.running() {
                break;
            }
            let is_b = dir_index >= part_a.len();
            indexed += self.index_root(root, is_b, dir_index as i64)?;
        }

        if self.running() {
            self.store_mut().repopulate_directory_table()?;
            self.config_mut().state = Progress::IndexedDirs;
            info!(target: "engine", indexed, "indexing_done");
        }
        self.commit()?;
        Ok(())
    }
}
