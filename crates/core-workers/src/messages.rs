//! Channel message shapes shared by the orchestrator and the workers.

use std::path::PathBuf;

/// Diff-row outcome codes, as stored in the catalog.
pub mod outcome {
    /// The pair failed with a captured error.
    pub const ERROR: i64 = 0;
    /// The pair was diffed.
    pub const COMPUTED: i64 = 1;
    /// Skipped: some rotation hash of x matched some rotation hash of y.
    pub const HASH_MATCH: i64 = 2;
    /// Skipped: aspect ratios differ beyond the configured tolerance.
    pub const ASPECT_MISMATCH: i64 = 3;
}

/// One file queued for preprocessing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessArg {
    pub key: i64,
    pub file_path: PathBuf,
}

/// First-loop work unit: a single file or a claimed batch.
#[derive(Debug, Clone)]
pub enum FirstLoopCmd {
    Single(PreprocessArg),
    Batch(Vec<PreprocessArg>),
}

/// Outcome of preprocessing one file.
///
/// `error` carries the failure text for rows that could not be decoded or
/// stored; such rows have no dimensions and no hashes.
#[derive(Debug, Clone)]
pub struct PreprocessResult {
    pub key: i64,
    pub org_x: i64,
    pub org_y: i64,
    /// Hash strings for the 0/90/180/270 rotations, when hashing ran.
    pub hashes: Option<[String; 4]>,
    pub error: Option<String>,
}

impl PreprocessResult {
    pub fn failure(key: i64, error: String) -> Self {
        Self {
            key,
            org_x: -1,
            org_y: -1,
            hashes: None,
            error: Some(error),
        }
    }
}

/// Second-loop work unit: one x row against a window of y rows within one
/// block. Hash and aspect payloads are only populated when the matching
/// short-circuit is enabled; per-row `None` entries mark rows that failed
/// the first loop.
#[derive(Debug, Clone)]
pub struct SecondLoopArgs {
    pub x: i64,
    pub y_start: i64,
    pub y_len: usize,
    pub x_hashes: Option<[i64; 4]>,
    pub y_hashes: Option<Vec<Option<[i64; 4]>>>,
    pub x_aspect: Option<f32>,
    pub y_aspects: Option<Vec<f32>>,
    /// Source path fallbacks for when a cache slot is unavailable.
    pub x_path: Option<PathBuf>,
    pub y_paths: Option<Vec<PathBuf>>,
    pub cache_key: usize,
}

/// Per-pair outcomes for one `SecondLoopArgs` unit.
#[derive(Debug, Clone, Default)]
pub struct SecondLoopResults {
    pub x: i64,
    pub cache_key: usize,
    /// `(key_a, key_b, outcome code, dif)` per resolved pair.
    pub success: Vec<(i64, i64, i64, f32)>,
    /// `(key_a, key_b, error)` per failed pair.
    pub errors: Vec<(i64, i64, String)>,
}
