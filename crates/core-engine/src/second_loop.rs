//! Second loop: the blockwise all-pairs comparison over the thumbnails.

use crate::{DifEngine, EngineError};
use core_cache::{BlockSlot, ThumbCache, Window};
use core_config::{MAX_BLOCK_EDGE, Progress};
use core_plan::{Block, build_blocks_pair, build_blocks_single};
use core_store::RowFields;
use core_workers::{
    POLL_INTERVAL, SecondLoopArgs, SecondLoopResults, SecondLoopSettings, SecondLoopWorker,
    cpu_diff, outcome,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, unbounded};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Mutable bookkeeping for one second-loop run.
struct LoopState {
    blocks: Vec<Block>,
    cache: Arc<ThumbCache>,
    /// Per-resident-block completion map: x key -> result dequeued.
    progress: BTreeMap<usize, HashMap<i64, bool>>,
    next_block: usize,
    /// Counters in x-row units; their distance bounds how far the enqueue
    /// cursor may run ahead of ingestion.
    enqueued: usize,
    dequeued: usize,
    exited: usize,
    edge: usize,
}

fn aspect_of(&(px, py): &(i64, i64)) -> f32 {
    // Rows that failed the first loop have no dimensions; NaN makes every
    // aspect comparison fall through to the (error-recording) compute path.
    if px <= 0 || py <= 0 {
        f32::NAN
    } else {
        core_imgops::aspect(px, py)
    }
}

impl DifEngine {
    /// Run the all-pairs comparison over every block of the plan.
    pub fn second_loop(&mut self) -> Result<(), EngineError> {
        info!(target: "engine", "second_loop_begin");
        if !self.running() {
            return Ok(());
        }

        let na = self.store_ref().partition_count(false, true)?;
        let nb = self.store_ref().partition_count(true, true)?;
        let cpu = self.config().cpu_proc;
        let gpu = self.config().second_loop.gpu_proc;

        let edge = match self.config().second_loop.batch_size {
            Some(edge) => edge.max(1),
            None => {
                let bound = if nb > 0 { na.min(nb) } else { na };
                bound.clamp(1, MAX_BLOCK_EDGE)
            }
        };
        self.config_mut().second_loop.batch_size = Some(edge);

        let mut parallel = self.config().second_loop.parallel;
        if na + nb < cpu + gpu {
            debug!(target: "engine", na, nb, "second_loop_sequential_fallback");
            parallel = false;
        }

        let blocks = if nb > 0 {
            build_blocks_pair(na, nb, edge)
        } else {
            build_blocks_single(na, edge)
        };
        info!(target: "engine", blocks = blocks.len(), edge, na, nb, "comparison_plan_built");

        // Resume skips every block already committed; a fresh entry starts
        // at zero with a new diff table.
        let start_block = if self.config().state == Progress::SecondLoopInProgress {
            self.config()
                .second_loop
                .finished_cache_index
                .map_or(0, |finished| finished + 1)
        } else {
            0
        };
        if !self.store_ref().diff_table_exists()? {
            self.store_ref().create_diff_table()?;
        }
        self.config_mut().second_loop.cache_index = start_block;
        self.config_mut().state = Progress::SecondLoopInProgress;
        self.commit()?;

        let mut state = LoopState {
            blocks,
            cache: Arc::new(ThumbCache::new()),
            progress: BTreeMap::new(),
            next_block: start_block,
            enqueued: 0,
            dequeued: 0,
            exited: 0,
            edge,
        };

        if parallel {
            self.parallel_second_loop(&mut state)?;
        } else {
            self.sequential_second_loop(&mut state)?;
        }

        if self.running() {
            self.config_mut().state = Progress::SecondLoopDone;
            self.commit()?;
            info!(target: "engine", pairs = self.store_ref().diff_row_count()?, "second_loop_done");
        } else {
            self.commit()?;
            info!(target: "engine", "second_loop_interrupted");
        }
        Ok(())
    }

    fn second_loop_settings(&self) -> SecondLoopSettings {
        SecondLoopSettings {
            target: self.config().compression_target,
            rotate: self.config().rotate,
            has_part_b: !self.config().part_b.is_empty(),
            match_aspect_by: self.config().second_loop.match_aspect_by,
            timeout: Duration::from_secs(self.config().child_timeout_secs),
        }
    }

    /// Whether the next block may be loaded: the dequeue cursor must be
    /// close enough and a cache slot must be free.
    fn can_enqueue(&self, state: &LoopState) -> bool {
        let preload = self.config().second_loop.preload_count;
        state.dequeued + preload * state.edge >= state.enqueued
            && state.cache.resident() <= preload
    }

    /// Load the next block's rows and thumbnails, publish its cache slot,
    /// and build one work unit per x row. `None` once the plan is spent.
    fn build_block_args(
        &mut self,
        state: &mut LoopState,
    ) -> Result<Option<Vec<SecondLoopArgs>>, EngineError> {
        let Some(&block) = state.blocks.get(state.next_block) else {
            return Ok(None);
        };
        let want = RowFields {
            paths: false,
            hashes: self.config().second_loop.skip_matching_hash,
            dims: self.config().second_loop.match_aspect_by.is_some(),
        };
        let target = self.config().compression_target;

        let x_rows = self
            .store_ref()
            .fetch_block_rows(block.x_start, block.x_len, want)?;
        let y_rows = if block.is_diagonal() {
            None
        } else {
            Some(
                self.store_ref()
                    .fetch_block_rows(block.y_start, block.y_len, want)?,
            )
        };

        let slot = if block.is_diagonal() {
            BlockSlot::diagonal(Window::load(
                self.thumb_dir(),
                block.x_start as i64,
                block.x_len,
                target,
            ))
        } else {
            BlockSlot::rect(
                Window::load(self.thumb_dir(), block.x_start as i64, block.x_len, target),
                Window::load(self.thumb_dir(), block.y_start as i64, block.y_len, target),
            )
        };
        state.cache.insert(block.cache_index, slot);
        state.progress.insert(
            block.cache_index,
            x_rows.keys.iter().map(|&key| (key, false)).collect(),
        );

        let y_view = y_rows.as_ref().unwrap_or(&x_rows);
        let y_hashes = y_view.hashes.clone();
        let y_aspects = y_view
            .dims
            .as_ref()
            .map(|dims| dims.iter().map(aspect_of).collect::<Vec<f32>>());
        let y_len = y_view.keys.len();

        let mut args = Vec::with_capacity(x_rows.keys.len());
        for (i, &x) in x_rows.keys.iter().enumerate() {
            args.push(SecondLoopArgs {
                x,
                y_start: block.y_start as i64,
                y_len,
                x_hashes: x_rows.hashes.as_ref().and_then(|hashes| hashes[i]),
                y_hashes: y_hashes.clone(),
                x_aspect: x_rows.dims.as_ref().map(|dims| aspect_of(&dims[i])),
                y_aspects: y_aspects.clone(),
                x_path: None,
                y_paths: None,
                cache_key: block.cache_index,
            });
        }
        state.enqueued += args.len();
        state.next_block += 1;
        self.config_mut().second_loop.cache_index = state.next_block;
        debug!(
            target: "engine",
            cache_index = block.cache_index,
            rows = args.len(),
            "block_enqueued"
        );
        Ok(Some(args))
    }

    /// Fold one result batch into the pending insert buffers, applying the
    /// threshold and aspect-sentinel filters.
    fn ingest_result(
        &self,
        state: &mut LoopState,
        result: SecondLoopResults,
        successes: &mut Vec<(i64, i64, i64, f32)>,
        errors: &mut Vec<(i64, i64, String)>,
    ) {
        if let Some(block) = state.progress.get_mut(&result.cache_key) {
            block.insert(result.x, true);
        }
        state.dequeued += 1;

        let threshold = self.config().second_loop.diff_threshold;
        let keep_aspect = self.config().second_loop.keep_non_matching_aspects;
        for row in result.success {
            if row.3 >= threshold {
                continue;
            }
            if row.2 == outcome::ASPECT_MISMATCH && !keep_aspect {
                continue;
            }
            successes.push(row);
        }
        errors.extend(result.errors);
    }

    fn flush_pairs(
        &mut self,
        successes: &mut Vec<(i64, i64, i64, f32)>,
        errors: &mut Vec<(i64, i64, String)>,
    ) -> Result<(), EngineError> {
        if !successes.is_empty() {
            self.store_mut().insert_diff_success(successes)?;
            successes.clear();
        }
        if !errors.is_empty() {
            self.store_mut().insert_diff_errors(errors)?;
            errors.clear();
        }
        Ok(())
    }

    /// Evict every fully-dequeued block from the cache frontier and advance
    /// the persisted finished checkpoint (monotone by construction).
    fn prune_cache(&mut self, state: &mut LoopState) {
        while let Some(lowest) = state.cache.lowest_index() {
            let done = state
                .progress
                .get(&lowest)
                .is_some_and(|rows| rows.values().all(|done| *done));
            if !done {
                break;
            }
            state.cache.evict(lowest);
            state.progress.remove(&lowest);
            self.config_mut().second_loop.finished_cache_index = Some(lowest);
            debug!(target: "engine", finished = lowest, "block_finished");
        }
    }

    /// Pull available results into the insert buffers. Returns false once
    /// the result channel is disconnected.
    fn drain_second_loop(
        &self,
        state: &mut LoopState,
        res_rx: &Receiver<Option<SecondLoopResults>>,
        blocking: bool,
        successes: &mut Vec<(i64, i64, i64, f32)>,
        errors: &mut Vec<(i64, i64, String)>,
    ) -> bool {
        loop {
            let message = if blocking {
                match res_rx.recv_timeout(POLL_INTERVAL) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => return true,
                    Err(RecvTimeoutError::Disconnected) => return false,
                }
            } else {
                match res_rx.try_recv() {
                    Ok(message) => message,
                    Err(TryRecvError::Empty) => return true,
                    Err(TryRecvError::Disconnected) => return false,
                }
            };
            match message {
                Some(result) => self.ingest_result(state, result, successes, errors),
                None => state.exited += 1,
            }
        }
    }

    fn parallel_second_loop(&mut self, state: &mut LoopState) -> Result<(), EngineError> {
        let settings = self.second_loop_settings();
        let workers = self.config().cpu_proc + self.config().second_loop.gpu_proc;

        let (cmd_tx, cmd_rx) = unbounded::<Option<SecondLoopArgs>>();
        let (res_tx, res_rx) = unbounded::<Option<SecondLoopResults>>();
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let worker = SecondLoopWorker::new(
                id,
                settings.clone(),
                state.cache.clone(),
                cpu_diff(),
                cmd_rx.clone(),
                res_tx.clone(),
            );
            let handle = std::thread::Builder::new()
                .name(format!("second-loop-{id}"))
                .spawn(move || worker.run())
                .map_err(|_| EngineError::WorkerPool)?;
            handles.push(handle);
        }
        drop(res_tx);
        drop(cmd_rx);

        let mut successes = Vec::new();
        let mut errors = Vec::new();
        let mut out_of_blocks = false;

        while self.running() {
            let mut advanced = false;
            if !out_of_blocks && self.can_enqueue(state) {
                match self.build_block_args(state)? {
                    Some(args) => {
                        advanced = true;
                        for arg in args {
                            if cmd_tx.send(Some(arg)).is_err() {
                                return Err(EngineError::WorkerPool);
                            }
                        }
                    }
                    None => out_of_blocks = true,
                }
            }

            let before = state.dequeued;
            let connected = self.drain_second_loop(state, &res_rx, false, &mut successes, &mut errors);
            self.flush_pairs(&mut successes, &mut errors)?;
            self.prune_cache(state);
            self.commit()?;
            if !connected {
                break;
            }
            if out_of_blocks && state.dequeued >= state.enqueued {
                break;
            }
            if !advanced && state.dequeued == before {
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        for _ in 0..workers {
            let _ = cmd_tx.send(None);
        }
        while state.exited < workers {
            let connected =
                self.drain_second_loop(state, &res_rx, true, &mut successes, &mut errors);
            self.flush_pairs(&mut successes, &mut errors)?;
            self.prune_cache(state);
            self.commit()?;
            if !connected {
                break;
            }
        }

        let mut panicked = false;
        for handle in handles {
            if handle.join().is_err() {
                panicked = true;
            }
        }
        if panicked || state.exited < workers {
            return Err(EngineError::WorkerPool);
        }
        debug!(target: "engine", dequeued = state.dequeued, "second_loop_drained");
        Ok(())
    }

    fn sequential_second_loop(&mut self, state: &mut LoopState) -> Result<(), EngineError> {
        // The worker body is reused inline; its channels are never polled.
        let (_cmd_tx, cmd_rx) = unbounded::<Option<SecondLoopArgs>>();
        let (res_tx, _res_rx) = unbounded::<Option<SecondLoopResults>>();
        let mut worker = SecondLoopWorker::new(
            0,
            self.second_loop_settings(),
            state.cache.clone(),
            cpu_diff(),
            cmd_rx,
            res_tx,
        );

        let mut successes = Vec::new();
        let mut errors = Vec::new();
        while self.running() {
            let Some(args) = self.build_block_args(state)? else {
                break;
            };
            for arg in &args {
                let result = worker.process(arg);
                self.ingest_result(state, result, &mut successes, &mut errors);
            }
            self.flush_pairs(&mut successes, &mut errors)?;
            self.prune_cache(state);
            self.commit()?;
        }
        Ok(())
    }
}
