//! Comparison workers: short-circuits plus the pixelwise diff.

use crate::POLL_INTERVAL;
use crate::messages::{SecondLoopArgs, SecondLoopResults, outcome};
use core_cache::{BlockSlot, ThumbCache};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Diff kernel seam. CPU workers get [`cpu_diff`]; a GPU-backed closure can
/// be slotted in for the extra workers without touching the pool.
pub type DiffFn = Arc<
    dyn Fn(&[u8], &[u8], u32, bool) -> Result<f32, core_imgops::DecodeError> + Send + Sync,
>;

pub fn cpu_diff() -> DiffFn {
    Arc::new(core_imgops::diff)
}

/// Immutable settings shared by every second-loop worker.
#[derive(Debug, Clone)]
pub struct SecondLoopSettings {
    /// Thumbnail edge in pixels.
    pub target: u32,
    /// Search all four rotations of the candidate in the diff.
    pub rotate: bool,
    /// Two-partition run: compare the full rectangle instead of the upper
    /// triangle.
    pub has_part_b: bool,
    /// Aspect-ratio tolerance; `None` disables the short-circuit.
    pub match_aspect_by: Option<f32>,
    /// Idle time after which the worker gives up and exits.
    pub timeout: Duration,
}

/// Resolve a thumbnail: cache slot first, source-path decode as fallback.
fn fetch_thumb<'a>(
    slot: Option<&'a BlockSlot>,
    key: i64,
    is_x: bool,
    path: Option<&Path>,
    target: u32,
) -> Result<Cow<'a, [u8]>, String> {
    if let Some(slot) = slot {
        let cached = if is_x {
            slot.x_thumb(key)
        } else {
            slot.y_thumb(key)
        };
        if let Some(pixels) = cached {
            return Ok(Cow::Borrowed(pixels));
        }
    }
    if let Some(path) = path {
        return core_imgops::decode_and_resize(path, (target, target))
            .map(|(pixels, _)| Cow::Owned(pixels))
            .map_err(|err| err.to_string());
    }
    Err(format!("no cached thumbnail for key {key}"))
}

/// One comparison worker thread body.
pub struct SecondLoopWorker {
    id: usize,
    settings: SecondLoopSettings,
    cache: Arc<ThumbCache>,
    diff_fn: DiffFn,
    cmd: Receiver<Option<SecondLoopArgs>>,
    out: Sender<Option<SecondLoopResults>>,
    /// Memoized handle for the block currently being worked.
    current_slot: Option<(usize, Arc<BlockSlot>)>,
}

impl SecondLoopWorker {
    pub fn new(
        id: usize,
        settings: SecondLoopSettings,
        cache: Arc<ThumbCache>,
        diff_fn: DiffFn,
        cmd: Receiver<Option<SecondLoopArgs>>,
        out: Sender<Option<SecondLoopResults>>,
    ) -> Self {
        Self {
            id,
            settings,
            cache,
            diff_fn,
            cmd,
            out,
            current_slot: None,
        }
    }

    fn prepare_slot(&mut self, cache_key: usize) -> Option<Arc<BlockSlot>> {
        match &self.current_slot {
            Some((key, slot)) if *key == cache_key => Some(slot.clone()),
            _ => {
                let slot = self.cache.slot(cache_key)?;
                self.current_slot = Some((cache_key, slot.clone()));
                Some(slot)
            }
        }
    }

    /// Resolve every candidate pair of one work unit.
    pub fn process(&mut self, args: &SecondLoopArgs) -> SecondLoopResults {
        let slot = self.prepare_slot(args.cache_key);
        let slot_ref = slot.as_deref();
        let mut results = SecondLoopResults {
            x: args.x,
            cache_key: args.cache_key,
            ..Default::default()
        };

        // The x thumbnail is shared by all candidates; fetched on first use.
        let mut x_pixels: Option<Result<Cow<'_, [u8]>, String>> = None;

        for i in 0..args.y_len {
            let y = args.y_start + i as i64;
            // Intra-partition blocks only own the strict upper triangle.
            if !self.settings.has_part_b && y <= args.x {
                continue;
            }

            if let (Some(x_hashes), Some(y_hashes)) = (&args.x_hashes, &args.y_hashes) {
                if let Some(Some(y_quad)) = y_hashes.get(i) {
                    if x_hashes.iter().any(|h| y_quad.contains(h)) {
                        results.success.push((args.x, y, outcome::HASH_MATCH, 0.0));
                        continue;
                    }
                }
            }

            if let (Some(tolerance), Some(x_aspect), Some(y_aspects)) = (
                self.settings.match_aspect_by,
                args.x_aspect,
                &args.y_aspects,
            ) {
                if let Some(y_aspect) = y_aspects.get(i) {
                    if (x_aspect - y_aspect).abs() > tolerance {
                        results
                            .success
                            .push((args.x, y, outcome::ASPECT_MISMATCH, -1.0));
                        continue;
                    }
                }
            }

            let x_fetch = x_pixels.get_or_insert_with(|| {
                fetch_thumb(
                    slot_ref,
                    args.x,
                    true,
                    args.x_path.as_deref(),
                    self.settings.target,
                )
            });
            let x_buf = match x_fetch {
                Ok(pixels) => pixels,
                Err(err) => {
                    results.errors.push((args.x, y, err.clone()));
                    continue;
                }
            };

            let y_path = args
                .y_paths
                .as_ref()
                .and_then(|paths| paths.get(i))
                .map(|p| p.as_path());
            match fetch_thumb(slot_ref, y, false, y_path, self.settings.target) {
                Ok(y_buf) => {
                    match (self.diff_fn)(x_buf, &y_buf, self.settings.target, self.settings.rotate)
                    {
                        Ok(dif) => results.success.push((args.x, y, outcome::COMPUTED, dif)),
                        Err(err) => results.errors.push((args.x, y, err.to_string())),
                    }
                }
                Err(err) => results.errors.push((args.x, y, err)),
            }
        }
        results
    }

    /// Consume work units until shutdown, disconnect, or idle timeout.
    /// Always emits the `None` sentinel on the way out.
    pub fn run(mut self) {
        let mut starved = Duration::ZERO;
        loop {
            match self.cmd.recv_timeout(POLL_INTERVAL) {
                Ok(Some(args)) => {
                    starved = Duration::ZERO;
                    let results = self.process(&args);
                    if self.out.send(Some(results)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!(target: "workers", id = self.id, "second_loop_worker_shutdown");
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    starved += POLL_INTERVAL;
                    if starved >= self.settings.timeout {
                        warn!(target: "workers", id = self.id, "second_loop_worker_starved");
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let _ = self.out.send(None);
    }
}
