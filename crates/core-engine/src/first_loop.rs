//! First loop: claim queued rows, decode + thumbnail + hash them through
//! the worker pool, and record results in bulk.

use crate::{DifEngine, EngineError};
use core_config::{MAX_FIRST_LOOP_BATCH, Progress};
use core_store::{PreprocessRow, StoreError};
use core_workers::{
    FirstLoopCmd, FirstLoopSettings, FirstLoopWorker, POLL_INTERVAL, PreprocessArg,
    PreprocessResult, preprocess,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, bounded, unbounded};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

impl DifEngine {
    /// Run preprocessing over every allowed-and-queued row.
    pub fn first_loop(&mut self) -> Result<(), EngineError> {
        info!(target: "engine", "first_loop_begin");
        if !self.running() {
            return Ok(());
        }

        let todo = self.store_ref().partition_count(false, true)?
            + self.store_ref().partition_count(true, true)?;
        let cpu = self.config().cpu_proc;

        // Runtime sizing: tiny inputs run inline, large ones claim in
        // batches proportional to the per-worker share.
        let mut parallel = self.config().first_loop.parallel;
        if todo < cpu {
            debug!(target: "engine", todo, cpu, "first_loop_sequential_fallback");
            parallel = false;
        }
        let batch_size = if todo / cpu < 40 {
            None
        } else {
            Some((todo / 4 / cpu).clamp(1, MAX_FIRST_LOOP_BATCH))
        };
        self.config_mut().first_loop.batch_size = batch_size;

        if self.config().first_loop.compute_hash && self.config().first_loop.shift_amount == 0 {
            warn!(
                target: "engine",
                "shift_amount_zero_only_exact_matches_collide"
            );
        }
        if self.config().first_loop.compute_hash && !self.store_ref().hash_table_exists()? {
            self.store_ref().create_hash_table()?;
        }
        if self.config().state == Progress::FirstLoopInProgress {
            info!(target: "engine", "resetting_claimed_rows");
            self.store_ref().reset_claimed()?;
        }

        self.config_mut().state = Progress::FirstLoopInProgress;
        self.commit()?;

        if parallel {
            self.parallel_first_loop()?;
        } else {
            self.sequential_first_loop()?;
        }

        if self.running() {
            self.config_mut().state = Progress::FirstLoopDone;
            self.commit()?;
            info!(target: "engine", "first_loop_done");
        } else {
            self.commit()?;
            info!(target: "engine", "first_loop_interrupted");
        }
        Ok(())
    }

    fn first_loop_settings(&self) -> FirstLoopSettings {
        FirstLoopSettings {
            compress: self.config().first_loop.compress,
            compute_hash: self.config().first_loop.compute_hash,
            target: self.config().compression_target,
            shift_amount: self.config().first_loop.shift_amount,
            thumb_dir: self.thumb_dir().to_path_buf(),
            timeout: Duration::from_secs(self.config().child_timeout_secs),
        }
    }

    fn sequential_first_loop(&mut self) -> Result<(), EngineError> {
        let settings = self.first_loop_settings();
        let claim_size = self
            .config()
            .first_loop
            .batch_size
            .unwrap_or(MAX_FIRST_LOOP_BATCH);
        while self.running() {
            let claimed = self.store_mut().claim_batch(claim_size)?;
            if claimed.is_empty() {
                break;
            }
            let results: Vec<PreprocessResult> = claimed
                .iter()
                .map(|file| {
                    preprocess(
                        &settings,
                        &PreprocessArg {
                            key: file.key,
                            file_path: file.path.clone(),
                        },
                    )
                })
                .collect();
            self.store_first_loop_batch(results)?;
            self.commit()?;
        }
        Ok(())
    }

    fn parallel_first_loop(&mut self) -> Result<(), EngineError> {
        let settings = Arc::new(self.first_loop_settings());
        let workers = self.config().cpu_proc;
        let batch_size = self.config().first_loop.batch_size;
        let claim_size = batch_size.unwrap_or(MAX_FIRST_LOOP_BATCH);

        let (cmd_tx, cmd_rx) = bounded::<Option<FirstLoopCmd>>(MAX_FIRST_LOOP_BATCH);
        let (res_tx, res_rx) = unbounded::<Option<Vec<PreprocessResult>>>();

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let worker =
                FirstLoopWorker::new(id, settings.clone(), cmd_rx.clone(), res_tx.clone());
            let handle = std::thread::Builder::new()
                .name(format!("first-loop-{id}"))
                .spawn(move || worker.run())
                .map_err(|_| EngineError::WorkerPool)?;
            handles.push(handle);
        }
        // The engine's clones must go so channel disconnection can signal a
        // dead pool.
        drop(res_tx);
        drop(cmd_rx);

        let mut enqueued = 0usize;
        let mut dequeued = 0usize;
        let mut exited = 0usize;

        while self.running() {
            let claimed = self.store_mut().claim_batch(claim_size)?;
            if claimed.is_empty() {
                break;
            }
            enqueued += claimed.len();
            let args: Vec<PreprocessArg> = claimed
                .into_iter()
                .map(|file| PreprocessArg {
                    key: file.key,
                    file_path: file.path,
                })
                .collect();
            // Full batches ship as one message, stragglers individually so
            // idle workers can steal them.
            let full_batch = batch_size.is_some_and(|size| args.len() == size);
            if full_batch {
                if cmd_tx.send(Some(FirstLoopCmd::Batch(args))).is_err() {
                    return Err(EngineError::WorkerPool);
                }
            } else {
                for arg in args {
                    if cmd_tx.send(Some(FirstLoopCmd::Single(arg))).is_err() {
                        return Err(EngineError::WorkerPool);
                    }
                }
            }
            self.drain_first_loop(&res_rx, &mut dequeued, &mut exited, false)?;
            self.commit()?;
            debug!(target: "engine", enqueued, dequeued, "first_loop_progress");
        }

        for _ in 0..workers {
            let _ = cmd_tx.send(None);
        }
        while exited < workers {
            let connected = self.drain_first_loop(&res_rx, &mut dequeued, &mut exited, true)?;
            self.commit()?;
            if !connected {
                break;
            }
        }
        self.commit()?;

        let mut panicked = false;
        for handle in handles {
            if handle.join().is_err() {
                panicked = true;
            }
        }
        if panicked || exited < workers {
            return Err(EngineError::WorkerPool);
        }
        debug!(target: "engine", enqueued, dequeued, "first_loop_drained");
        Ok(())
    }

    /// Pull available results and persist them. Returns false once the
    /// result channel is disconnected (every worker gone).
    fn drain_first_loop(
        &mut self,
        res_rx: &Receiver<Option<Vec<PreprocessResult>>>,
        dequeued: &mut usize,
        exited: &mut usize,
        blocking: bool,
    ) -> Result<bool, EngineError> {
        let mut collected = Vec::new();
        let mut connected = true;
        loop {
            let message = if blocking {
                match res_rx.recv_timeout(POLL_INTERVAL) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        connected = false;
                        break;
                    }
                }
            } else {
                match res_rx.try_recv() {
                    Ok(message) => message,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        connected = false;
                        break;
                    }
                }
            };
            match message {
                Some(results) => {
                    *dequeued += results.len();
                    collected.extend(results);
                }
                None => *exited += 1,
            }
        }
        self.store_first_loop_batch(collected)?;
        Ok(connected)
    }

    /// Persist one drained batch: hashes first so the foreign keys resolve,
    /// then error rows and success rows.
    fn store_first_loop_batch(
        &mut self,
        results: Vec<PreprocessResult>,
    ) -> Result<(), EngineError> {
        if results.is_empty() {
            return Ok(());
        }

        let mut lookup: HashMap<String, i64> = HashMap::new();
        if self.config().first_loop.compute_hash {
            let mut all: Vec<String> = Vec::new();
            for result in &results {
                if let Some(hashes) = &result.hashes {
                    all.extend(hashes.iter().cloned());
                }
            }
            if !all.is_empty() {
                self.store_mut().upsert_hashes(&all)?;
                let unique: HashSet<String> = all.into_iter().collect();
                lookup = self.store_ref().hash_lookup(&unique)?;
            }
        }

        let mut errors: Vec<(i64, String)> = Vec::new();
        let mut successes: Vec<PreprocessRow> = Vec::new();
        for result in results {
            if let Some(error) = result.error {
                errors.push((result.key, error));
                continue;
            }
            let hashes = match &result.hashes {
                Some(strings) => Some(resolve_hash_keys(&lookup, strings)?),
                None => None,
            };
            successes.push(PreprocessRow {
                key: result.key,
                px: result.org_x,
                py: result.org_y,
                hashes,
            });
        }
        debug!(
            target: "engine",
            ok = successes.len(),
            failed = errors.len(),
            "first_loop_batch_stored"
        );
        self.store_mut().record_preprocess_errors(&errors)?;
        self.store_mut().record_preprocess_success(&successes)?;
        Ok(())
    }
}

fn resolve_hash_keys(
    lookup: &HashMap<String, i64>,
    strings: &[String; 4],
) -> Result<[i64; 4], StoreError> {
    let mut keys = [0i64; 4];
    for (slot, hash) in keys.iter_mut().zip(strings.iter()) {
        *slot = *lookup
            .get(hash)
            .ok_or_else(|| StoreError::HashMiss(hash.clone()))?;
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_config::Config;
    use core_store::RowFields;
    use std::path::Path;

    fn write_image(dir: &Path, name: &str, fill: u8) {
        let pixels = vec![fill; 16 * 16 * core_imgops::CHANNELS];
        core_imgops::store_thumbnail(&pixels, (16, 16), &dir.join(name)).unwrap();
    }

    fn engine_with_images(count: usize, compute_hash: bool) -> (tempfile::TempDir, DifEngine) {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..count {
            write_image(dir.path(), &format!("img_{i}.png"), (i * 11 % 256) as u8);
        }
        let mut config = Config::new(vec![dir.path().to_path_buf()], Vec::new());
        config.compression_target = 8;
        config.first_loop.compute_hash = compute_hash;
        config.cpu_proc = 2;
        let mut engine = DifEngine::fresh(config).unwrap();
        engine.full_index().unwrap();
        (dir, engine)
    }

    #[test]
    fn first_loop_processes_every_allowed_row() {
        let (dir, mut engine) = engine_with_images(5, false);
        engine.first_loop().unwrap();

        assert_eq!(engine.state(), Progress::FirstLoopDone);
        let states = engine.store_ref().success_state_counts().unwrap();
        assert_eq!(states.get(&1), Some(&5));
        assert!(!states.contains_key(&-2));
        let thumb_dir = dir.path().join(core_config::THUMB_DIR);
        for key in 0..5 {
            assert!(thumb_dir.join(format!("{key}.png")).exists());
        }
    }

    #[test]
    fn hashing_populates_all_four_columns() {
        let (_dir, mut engine) = engine_with_images(4, true);
        engine.first_loop().unwrap();

        let rows = engine
            .store_ref()
            .fetch_block_rows(0, 4, RowFields { hashes: true, dims: true, ..Default::default() })
            .unwrap();
        for quad in rows.hashes.unwrap() {
            assert!(quad.is_some());
        }
        for (px, py) in rows.dims.unwrap() {
            assert_eq!((px, py), (16, 16));
        }
    }

    #[test]
    fn decode_failures_become_error_rows() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "good.png", 10);
        std::fs::write(dir.path().join("bad.png"), b"not a png").unwrap();

        let mut config = Config::new(vec![dir.path().to_path_buf()], Vec::new());
        config.compression_target = 8;
        let mut engine = DifEngine::fresh(config).unwrap();
        engine.full_index().unwrap();
        engine.first_loop().unwrap();

        assert_eq!(engine.state(), Progress::FirstLoopDone);
        let states = engine.store_ref().success_state_counts().unwrap();
        assert_eq!(states.get(&1), Some(&1));
        assert_eq!(states.get(&0), Some(&1));
    }

    #[test]
    fn interrupt_before_loop_leaves_state_untouched() {
        let (_dir, mut engine) = engine_with_images(3, false);
        engine
            .run_flag()
            .store(false, std::sync::atomic::Ordering::SeqCst);
        engine.first_loop().unwrap();
        // The loop never advanced to done and claimed nothing.
        assert_eq!(engine.state(), Progress::IndexedDirs);
    }

    #[test]
    fn restart_resets_claimed_rows_before_looping() {
        let (_dir, mut engine) = engine_with_images(3, false);
        // Simulate a crash mid-loop: rows claimed, state persisted as
        // in-progress, nothing recorded.
        engine.store_mut().claim_batch(2).unwrap();
        engine.config_mut().state = Progress::FirstLoopInProgress;

        engine.first_loop().unwrap();
        let states = engine.store_ref().success_state_counts().unwrap();
        assert_eq!(states.get(&1), Some(&3));
        assert_eq!(engine.state(), Progress::FirstLoopDone);
    }
}
