//! The orchestrator: owns the catalog, the config snapshot, and the worker
//! pools, and drives the pipeline state machine
//! `Init -> IndexedDirs -> FirstLoop... -> SecondLoop... -> SecondLoopDone`.
//!
//! A single engine thread performs every catalog and config mutation.
//! Workers only ever see channel messages and read-only cache handles, so
//! crash-resume reduces to replaying the persisted snapshot: claimed-but-
//! unfinished rows are requeued, finished comparison blocks are skipped by
//! their cache index, and replayed pairs bounce off the catalog's unique
//! pair index.

mod first_loop;
mod second_loop;
mod walker;

use core_config::{ArtifactPaths, Config, ConfigError, Progress};
use core_store::{Catalog, StoreError};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot resume: {0}")]
    Resume(String),
    #[error("worker pool terminated unexpectedly")]
    WorkerPool,
    #[error("interrupted by signal; progress persisted")]
    Interrupted,
}

/// Partition sizes plus the projected thumbnail footprint, for summaries.
#[derive(Debug, Clone, Copy)]
pub struct StorageReport {
    pub a_total: usize,
    pub a_allowed: usize,
    pub b_total: usize,
    pub b_allowed: usize,
    pub thumb_bytes: u64,
}

pub struct DifEngine {
    config: Config,
    paths: ArtifactPaths,
    store: Catalog,
    run: Arc<AtomicBool>,
}

impl DifEngine {
    /// Start a fresh run, discarding any artifacts a previous run left
    /// under the same roots.
    pub fn fresh(config: Config) -> Result<Self, EngineError> {
        config.validate()?;
        let paths = config.artifact_paths()?;
        for root in config.part_a.iter().chain(config.part_b.iter()) {
            if !root.is_dir() {
                return Err(ConfigError::RootMissing(root.clone()).into());
            }
        }

        if paths.db.exists() {
            info!(target: "engine", db = %paths.db.display(), "removing_preexisting_db");
            let _ = std::fs::remove_file(&paths.db);
        }
        // WAL sidecars go with the database.
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = paths.db.as_os_str().to_owned();
            sidecar.push(suffix);
            let _ = std::fs::remove_file(Path::new(&sidecar));
        }
        if paths.task.exists() {
            info!(target: "engine", task = %paths.task.display(), "removing_preexisting_task_file");
            let _ = std::fs::remove_file(&paths.task);
        }
        if paths.thumbs.exists() {
            info!(target: "engine", dir = %paths.thumbs.display(), "removing_preexisting_thumbnails");
            let _ = std::fs::remove_dir_all(&paths.thumbs);
        }
        std::fs::create_dir_all(&paths.thumbs).map_err(|err| {
            EngineError::Resume(format!(
                "cannot create thumbnail directory {}: {err}",
                paths.thumbs.display()
            ))
        })?;

        let store = Catalog::open(&paths.db)?;
        let mut engine = Self {
            config,
            paths,
            store,
            run: Arc::new(AtomicBool::new(true)),
        };
        engine.commit()?;
        Ok(engine)
    }

    /// Reconnect to the run described by an existing task file.
    pub fn resume_from(task_path: &Path) -> Result<Self, EngineError> {
        let config = Config::load(task_path)?;
        config.validate()?;
        let paths = config.artifact_paths()?;

        for root in config.part_a.iter().chain(config.part_b.iter()) {
            if !root.is_dir() {
                return Err(EngineError::Resume(format!(
                    "configured root no longer exists: {}",
                    root.display()
                )));
            }
        }
        if !paths.db.exists() {
            return Err(EngineError::Resume(format!(
                "catalog database missing: {}",
                paths.db.display()
            )));
        }
        if !paths.thumbs.is_dir() {
            return Err(EngineError::Resume(format!(
                "thumbnail directory missing: {}",
                paths.thumbs.display()
            )));
        }

        let store = Catalog::open(&paths.db)?;
        info!(target: "engine", state = ?config.state, "resuming_existing_run");
        Ok(Self {
            config,
            paths,
            store,
            run: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Resume when a task file exists and `purge` is off, start fresh
    /// otherwise.
    pub fn open(config: Config, purge: bool) -> Result<Self, EngineError> {
        let paths = config.artifact_paths()?;
        if !purge && paths.task.exists() {
            Self::resume_from(&paths.task)
        } else {
            Self::fresh(config)
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> Progress {
        self.config.state
    }

    /// Shared cancellation flag; clearing it makes every loop wind down at
    /// its next checkpoint.
    pub fn run_flag(&self) -> Arc<AtomicBool> {
        self.run.clone()
    }

    pub(crate) fn running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    /// Route SIGINT into the cancellation flag.
    pub fn install_sigint_handler(&self) -> Result<(), ctrlc::Error> {
        let run = self.run.clone();
        ctrlc::set_handler(move || {
            run.store(false, Ordering::SeqCst);
        })
    }

    /// Persist the config snapshot. Catalog writes are transactional per
    /// bulk operation, so the snapshot is the only thing left to flush.
    pub fn commit(&mut self) -> Result<(), EngineError> {
        if self.config.retain_progress {
            self.config.save(&self.paths.task)?;
        }
        Ok(())
    }

    /// Drive the remaining pipeline stages to completion.
    pub fn run_to_completion(&mut self) -> Result<(), EngineError> {
        if self.config.state == Progress::SecondLoopDone {
            info!(target: "engine", "run_already_complete");
            return Ok(());
        }

        if self.config.state == Progress::Init {
            self.full_index()?;
        }
        if !self.running() {
            self.commit()?;
            return Err(EngineError::Interrupted);
        }

        if matches!(
            self.config.state,
            Progress::IndexedDirs | Progress::FirstLoopInProgress
        ) {
            self.first_loop()?;
        }
        if !self.running() {
            self.commit()?;
            return Err(EngineError::Interrupted);
        }

        if matches!(
            self.config.state,
            Progress::FirstLoopDone | Progress::SecondLoopInProgress
        ) {
            self.second_loop()?;
        }
        if !self.running() {
            self.commit()?;
            return Err(EngineError::Interrupted);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Query surface
    // ---------------------------------------------------------------------

    /// Pairs below `delta` (defaulting to the configured threshold),
    /// ordered by pair key.
    pub fn diff_pairs(
        &self,
        delta: Option<f32>,
        include_hash_match: bool,
    ) -> Result<Vec<(String, String, f32)>, EngineError> {
        let delta = self.effective_delta(delta);
        Ok(self.store.duplicate_pairs(delta, include_hash_match)?)
    }

    /// Clusters of pairs below `delta`, anchored on the `key_a` side (or
    /// `key_b` when `group_a` is false).
    pub fn diff_clusters(
        &self,
        delta: Option<f32>,
        group_a: bool,
        include_hash_match: bool,
    ) -> Result<Vec<(String, Vec<(String, f32)>)>, EngineError> {
        let delta = self.effective_delta(delta);
        Ok(self.store.clusters(delta, group_a, include_hash_match)?)
    }

    fn effective_delta(&self, delta: Option<f32>) -> f32 {
        let threshold = self.config.second_loop.diff_threshold;
        match delta {
            Some(delta) => {
                if delta > threshold {
                    warn!(
                        target: "engine",
                        delta,
                        threshold,
                        "delta_exceeds_threshold_results_may_be_incomplete"
                    );
                }
                delta
            }
            None => threshold,
        }
    }

    /// Drop every stored pair above the threshold.
    pub fn reduce_diff(&mut self, threshold: f32) -> Result<usize, EngineError> {
        Ok(self.store.drop_diff_above(threshold)?)
    }

    pub fn diff_row_count(&self) -> Result<usize, EngineError> {
        Ok(self.store.diff_row_count()?)
    }

    /// Partition sizes and the projected on-disk thumbnail footprint.
    pub fn storage_report(&self) -> Result<StorageReport, EngineError> {
        let a_total = self.store.partition_count(false, false)?;
        let a_allowed = self.store.partition_count(false, true)?;
        let b_total = self.store.partition_count(true, false)?;
        let b_allowed = self.store.partition_count(true, true)?;
        let per_thumb = u64::from(self.config.compression_target)
            * u64::from(self.config.compression_target)
            * core_imgops::CHANNELS as u64;
        Ok(StorageReport {
            a_total,
            a_allowed,
            b_total,
            b_allowed,
            thumb_bytes: (a_allowed + b_allowed) as u64 * per_thumb,
        })
    }

    /// Override the cleanup policy ahead of a [`Self::cleanup`] call.
    pub fn set_cleanup_policy(&mut self, retain_progress: bool, delete_db: bool, delete_thumb: bool) {
        self.config.retain_progress = retain_progress;
        self.config.delete_db = delete_db;
        self.config.delete_thumb = delete_thumb;
    }

    /// Tear down run artifacts according to the cleanup policy.
    pub fn cleanup(self) -> Result<(), EngineError> {
        let Self {
            config,
            paths,
            store,
            ..
        } = self;
        drop(store);

        if config.delete_db {
            info!(target: "engine", db = %paths.db.display(), "deleting_catalog_db");
            if let Err(err) = std::fs::remove_file(&paths.db) {
                warn!(target: "engine", error = %err, "db_delete_failed");
            }
            for suffix in ["-wal", "-shm"] {
                let mut sidecar = paths.db.as_os_str().to_owned();
                sidecar.push(suffix);
                let _ = std::fs::remove_file(Path::new(&sidecar));
            }
        }
        if config.delete_thumb && paths.thumbs.exists() {
            info!(target: "engine", dir = %paths.thumbs.display(), "deleting_thumbnails");
            if let Err(err) = std::fs::remove_dir_all(&paths.thumbs) {
                warn!(target: "engine", error = %err, "thumbnail_delete_failed");
            }
        }
        if !config.retain_progress && paths.task.exists() {
            info!(target: "engine", task = %paths.task.display(), "deleting_task_file");
            if let Err(err) = std::fs::remove_file(&paths.task) {
                warn!(target: "engine", error = %err, "task_file_delete_failed");
            }
        }
        Ok(())
    }

    // Shared access for the loop modules.
    pub(crate) fn store_mut(&mut self) -> &mut Catalog {
        &mut self.store
    }

    pub(crate) fn store_ref(&self) -> &Catalog {
        &self.store
    }

    pub(crate) fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub(crate) fn thumb_dir(&self) -> &Path {
        &self.paths.thumbs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_config::TASK_FILE;
    use std::path::PathBuf;

    fn image_dir(count: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..count {
            let pixels = vec![(i * 10 % 256) as u8; 16 * 16 * core_imgops::CHANNELS];
            core_imgops::store_thumbnail(
                &pixels,
                (16, 16),
                &dir.path().join(format!("img_{i}.png")),
            )
            .unwrap();
        }
        dir
    }

    #[test]
    fn fresh_engine_creates_artifacts_and_snapshot() {
        let dir = image_dir(2);
        let config = Config::new(vec![dir.path().to_path_buf()], Vec::new());
        let engine = DifEngine::fresh(config).unwrap();

        assert!(dir.path().join(TASK_FILE).exists());
        assert!(dir.path().join(core_config::DB_FILE).exists());
        assert!(dir.path().join(core_config::THUMB_DIR).is_dir());
        assert_eq!(engine.state(), Progress::Init);
    }

    #[test]
    fn fresh_rejects_missing_roots() {
        let config = Config::new(vec![PathBuf::from("/definitely/not/here")], Vec::new());
        assert!(matches!(
            DifEngine::fresh(config),
            Err(EngineError::Config(ConfigError::RootMissing(_)))
        ));
    }

    #[test]
    fn open_resumes_from_existing_task_file() {
        let dir = image_dir(2);
        let config = Config::new(vec![dir.path().to_path_buf()], Vec::new());
        {
            let mut engine = DifEngine::fresh(config.clone()).unwrap();
            engine.config_mut().state = Progress::IndexedDirs;
            engine.commit().unwrap();
        }
        let resumed = DifEngine::open(config.clone(), false).unwrap();
        assert_eq!(resumed.state(), Progress::IndexedDirs);

        // Purge starts over.
        let fresh = DifEngine::open(config, true).unwrap();
        assert_eq!(fresh.state(), Progress::Init);
    }

    #[test]
    fn resume_fails_when_db_is_gone() {
        let dir = image_dir(1);
        let config = Config::new(vec![dir.path().to_path_buf()], Vec::new());
        let task = dir.path().join(TASK_FILE);
        {
            let _engine = DifEngine::fresh(config).unwrap();
        }
        std::fs::remove_file(dir.path().join(core_config::DB_FILE)).unwrap();
        assert!(matches!(
            DifEngine::resume_from(&task),
            Err(EngineError::Resume(_))
        ));
    }

    #[test]
    fn cleanup_honors_retention_policy() {
        let dir = image_dir(1);
        let mut config = Config::new(vec![dir.path().to_path_buf()], Vec::new());
        config.retain_progress = false;
        let mut engine = DifEngine::fresh(config).unwrap();
        // With retain_progress off the snapshot is never written.
        engine.commit().unwrap();
        assert!(!dir.path().join(TASK_FILE).exists());
        engine.cleanup().unwrap();
        assert!(!dir.path().join(core_config::DB_FILE).exists());
        assert!(!dir.path().join(core_config::THUMB_DIR).exists());
    }

    #[test]
    fn cleanup_can_keep_everything() {
        let dir = image_dir(1);
        let mut config = Config::new(vec![dir.path().to_path_buf()], Vec::new());
        config.delete_db = false;
        config.delete_thumb = false;
        let engine = DifEngine::fresh(config).unwrap();
        engine.cleanup().unwrap();
        assert!(dir.path().join(core_config::DB_FILE).exists());
        assert!(dir.path().join(core_config::THUMB_DIR).exists());
        assert!(dir.path().join(TASK_FILE).exists());
    }

    #[test]
    fn run_flag_propagates_cancellation() {
        let dir = image_dir(1);
        let config = Config::new(vec![dir.path().to_path_buf()], Vec::new());
        let engine = DifEngine::fresh(config).unwrap();
        assert!(engine.running());
        engine.run_flag().store(false, Ordering::SeqCst);
        assert!(!engine.running());
    }
}
