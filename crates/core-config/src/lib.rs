//! Job configuration and the persisted task snapshot.
//!
//! A run is described by a single [`Config`] value. It is created from CLI
//! arguments (fresh run) or deserialized from the task file next to the
//! first partition-A root (resumed run). The orchestrator is the only
//! mutator: it advances [`Progress`] at state transitions and rewrites the
//! snapshot on every commit, which is what makes a run resumable after a
//! crash or SIGINT.
//!
//! Unknown fields in the task file are ignored so older snapshots keep
//! loading across minor releases.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Default task-file name, placed under the first partition-A root.
pub const TASK_FILE: &str = ".task.json";
/// Default catalog database name, placed under the first partition-A root.
pub const DB_FILE: &str = ".fast_diff.db";
/// Default thumbnail directory name, placed under the first partition-A root.
pub const THUMB_DIR: &str = ".temp_thumb";

/// Upper bound on the first-loop claim size; also the bound of the loop-1
/// command channel.
pub const MAX_FIRST_LOOP_BATCH: usize = 400;
/// Upper bound on the second-loop block edge when it is auto-derived.
pub const MAX_BLOCK_EDGE: usize = 100;

/// Pipeline state, persisted in the task snapshot.
///
/// Transitions only move forward; a signal leaves the state wherever it was
/// so the next start can pick the matching resume path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    #[default]
    Init,
    IndexedDirs,
    FirstLoopInProgress,
    FirstLoopDone,
    SecondLoopInProgress,
    SecondLoopDone,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no roots configured for partition A")]
    NoRoots,
    #[error("root directory does not exist: {0}")]
    RootMissing(PathBuf),
    #[error("overlapping roots: {parent} contains {child}")]
    OverlappingRoots { parent: PathBuf, child: PathBuf },
    #[error("hash shift amount {0} outside [-7, 7]")]
    ShiftOutOfRange(i32),
    #[error("{0}")]
    Incompatible(&'static str),
    #[error("failed to read task file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write task file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed task file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Settings for the preprocessing loop (thumbnailing + hashing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirstLoopConfig {
    /// Write a fixed-size thumbnail per allowed file. The comparison loop
    /// requires thumbnails, so this stays on for full runs.
    #[serde(default = "FirstLoopConfig::default_compress")]
    pub compress: bool,
    /// Compute the four rotation hashes per file.
    #[serde(default)]
    pub compute_hash: bool,
    /// Per-channel bit shift applied before hashing; larger values collide
    /// more aggressively. Valid range [-7, 7].
    #[serde(default = "FirstLoopConfig::default_shift_amount")]
    pub shift_amount: i32,
    /// Claim size per store round-trip. `None` selects one automatically
    /// from the file count and worker count.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Run with a worker pool; disabled automatically for tiny inputs.
    #[serde(default = "FirstLoopConfig::default_parallel")]
    pub parallel: bool,
}

impl Default for FirstLoopConfig {
    fn default() -> Self {
        Self {
            compress: Self::default_compress(),
            compute_hash: false,
            shift_amount: Self::default_shift_amount(),
            batch_size: None,
            parallel: Self::default_parallel(),
        }
    }
}

impl FirstLoopConfig {
    const fn default_compress() -> bool {
        true
    }
    const fn default_shift_amount() -> i32 {
        4
    }
    const fn default_parallel() -> bool {
        true
    }
}

/// Settings for the all-pairs comparison loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondLoopConfig {
    /// Block edge of the comparison plan. `None` selects one automatically
    /// from the partition sizes.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Record pairs whose rotation hashes collide without diffing them.
    #[serde(default)]
    pub skip_matching_hash: bool,
    /// Aspect-ratio tolerance; pairs further apart than this are recorded
    /// as mismatched without diffing. `None` disables the short-circuit.
    #[serde(default)]
    pub match_aspect_by: Option<f32>,
    /// Pairs with `dif` at or above this are discarded at ingestion.
    #[serde(default = "SecondLoopConfig::default_diff_threshold")]
    pub diff_threshold: f32,
    /// Keep aspect-mismatch sentinel rows instead of dropping them.
    #[serde(default)]
    pub keep_non_matching_aspects: bool,
    /// Extra diff workers fed by a GPU-capable diff function.
    #[serde(default)]
    pub gpu_proc: usize,
    /// Run with a worker pool; disabled automatically for tiny inputs.
    #[serde(default = "SecondLoopConfig::default_parallel")]
    pub parallel: bool,
    /// Blocks allowed in flight beyond the dequeue cursor.
    #[serde(default = "SecondLoopConfig::default_preload_count")]
    pub preload_count: usize,
    /// Next block to enqueue. Runtime cursor, persisted for diagnostics.
    #[serde(default)]
    pub cache_index: usize,
    /// Highest block whose results are fully committed. Resume restarts at
    /// the block after this one.
    #[serde(default)]
    pub finished_cache_index: Option<usize>,
}

impl Default for SecondLoopConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            skip_matching_hash: false,
            match_aspect_by: None,
            diff_threshold: Self::default_diff_threshold(),
            keep_non_matching_aspects: false,
            gpu_proc: 0,
            parallel: Self::default_parallel(),
            preload_count: Self::default_preload_count(),
            cache_index: 0,
            finished_cache_index: None,
        }
    }
}

impl SecondLoopConfig {
    const fn default_diff_threshold() -> f32 {
        200.0
    }
    const fn default_parallel() -> bool {
        true
    }
    const fn default_preload_count() -> usize {
        2
    }
}

/// Resolved on-disk locations of the run's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub db: PathBuf,
    pub thumbs: PathBuf,
    pub task: PathBuf,
}

/// Full job description, serialized to the task file on every commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Roots of partition A. At least one is required.
    pub part_a: Vec<PathBuf>,
    /// Roots of partition B; empty means an intra-A comparison.
    #[serde(default)]
    pub part_b: Vec<PathBuf>,
    /// Descend into subdirectories while indexing.
    #[serde(default = "Config::default_recurse")]
    pub recurse: bool,
    /// Case-insensitive extension allow-list (with leading dot).
    #[serde(default = "Config::default_extensions")]
    pub allowed_extensions: Vec<String>,
    /// File or directory basenames skipped during the walk.
    #[serde(default)]
    pub ignore_names: Vec<String>,
    /// Absolute paths skipped during the walk.
    #[serde(default)]
    pub ignore_paths: Vec<PathBuf>,
    /// Thumbnail edge in pixels; all comparisons happen at this square size.
    #[serde(default = "Config::default_compression_target")]
    pub compression_target: u32,
    /// Take the minimum diff over all four rotations of the candidate.
    #[serde(default)]
    pub rotate: bool,
    /// CPU worker count for both loops.
    #[serde(default = "Config::default_cpu_proc")]
    pub cpu_proc: usize,
    /// Seconds an idle worker waits on an empty channel before exiting.
    #[serde(default = "Config::default_child_timeout_secs")]
    pub child_timeout_secs: u64,
    /// Override for the catalog database location.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Override for the thumbnail directory.
    #[serde(default)]
    pub thumb_dir: Option<PathBuf>,
    /// Override for the task-file location.
    #[serde(default)]
    pub task_path: Option<PathBuf>,
    #[serde(default)]
    pub state: Progress,
    /// Rewrite the task file on commit so the run can be resumed.
    #[serde(default = "Config::default_true")]
    pub retain_progress: bool,
    /// Remove the catalog database during cleanup.
    #[serde(default = "Config::default_true")]
    pub delete_db: bool,
    /// Remove the thumbnail directory during cleanup.
    #[serde(default = "Config::default_true")]
    pub delete_thumb: bool,
    #[serde(default)]
    pub first_loop: FirstLoopConfig,
    #[serde(default)]
    pub second_loop: SecondLoopConfig,
}

impl Config {
    pub fn new(part_a: Vec<PathBuf>, part_b: Vec<PathBuf>) -> Self {
        Self {
            part_a,
            part_b,
            recurse: Self::default_recurse(),
            allowed_extensions: Self::default_extensions(),
            ignore_names: Vec::new(),
            ignore_paths: Vec::new(),
            compression_target: Self::default_compression_target(),
            rotate: false,
            cpu_proc: Self::default_cpu_proc(),
            child_timeout_secs: Self::default_child_timeout_secs(),
            db_path: None,
            thumb_dir: None,
            task_path: None,
            state: Progress::Init,
            retain_progress: Self::default_true(),
            delete_db: Self::default_true(),
            delete_thumb: Self::default_true(),
            first_loop: FirstLoopConfig::default(),
            second_loop: SecondLoopConfig::default(),
        }
    }

    const fn default_recurse() -> bool {
        true
    }
    const fn default_compression_target() -> u32 {
        64
    }
    const fn default_child_timeout_secs() -> u64 {
        30
    }
    const fn default_true() -> bool {
        true
    }

    fn default_cpu_proc() -> usize {
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
    }

    fn default_extensions() -> Vec<String> {
        [
            ".jpg", ".jpeg", ".png", ".bmp", ".tiff", ".tif", ".gif", ".webp",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// Resolve db/thumb/task locations, deriving defaults under the first
    /// partition-A root when no override is set.
    pub fn artifact_paths(&self) -> Result<ArtifactPaths, ConfigError> {
        let root = self.part_a.first().ok_or(ConfigError::NoRoots)?;
        let db = self
            .db_path
            .clone()
            .unwrap_or_else(|| root.join(DB_FILE));
        let thumbs = self
            .thumb_dir
            .clone()
            .unwrap_or_else(|| root.join(THUMB_DIR));
        let task = self
            .task_path
            .clone()
            .unwrap_or_else(|| root.join(TASK_FILE));
        Ok(ArtifactPaths { db, thumbs, task })
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.part_a.is_empty() {
            return Err(ConfigError::NoRoots);
        }
        if !(-7..=7).contains(&self.first_loop.shift_amount) {
            return Err(ConfigError::ShiftOutOfRange(self.first_loop.shift_amount));
        }
        if self.compression_target == 0 {
            return Err(ConfigError::Incompatible(
                "compression target must be at least 1 pixel",
            ));
        }
        if self.cpu_proc == 0 {
            return Err(ConfigError::Incompatible("cpu_proc must be at least 1"));
        }
        if self.second_loop.skip_matching_hash && !self.first_loop.compute_hash {
            return Err(ConfigError::Incompatible(
                "skip_matching_hash requires compute_hash in the first loop",
            ));
        }
        if !self.first_loop.compress {
            return Err(ConfigError::Incompatible(
                "the comparison loop requires thumbnails from the first loop",
            ));
        }
        Ok(())
    }

    /// Whether a path passes the extension allow-list (case-insensitive).
    pub fn extension_allowed(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let dotted = format!(".{}", ext.to_ascii_lowercase());
        self.allowed_extensions
            .iter()
            .any(|a| a.eq_ignore_ascii_case(&dotted))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(target: "config", path = %path.display(), state = ?cfg.state, "task_file_loaded");
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, raw).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}
