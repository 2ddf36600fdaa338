//! Preprocessing workers: decode, resize, thumbnail, hash.

use crate::messages::{FirstLoopCmd, PreprocessArg, PreprocessResult};
use crate::POLL_INTERVAL;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Immutable settings shared by every first-loop worker.
#[derive(Debug, Clone)]
pub struct FirstLoopSettings {
    /// Write `<thumb_dir>/<key>.png` per processed file.
    pub compress: bool,
    /// Compute the four rotation hashes per processed file.
    pub compute_hash: bool,
    /// Thumbnail edge in pixels.
    pub target: u32,
    /// Quantization shift for the perceptual hash.
    pub shift_amount: i32,
    pub thumb_dir: PathBuf,
    /// Idle time after which the worker gives up and exits.
    pub timeout: Duration,
}

/// Preprocess one file. Failures become row data, never panics or errors.
pub fn preprocess(settings: &FirstLoopSettings, arg: &PreprocessArg) -> PreprocessResult {
    let target = (settings.target, settings.target);
    let (pixels, (org_x, org_y)) = match core_imgops::decode_and_resize(&arg.file_path, target) {
        Ok(decoded) => decoded,
        Err(err) => {
            debug!(target: "workers", key = arg.key, error = %err, "preprocess_decode_failed");
            return PreprocessResult::failure(arg.key, err.to_string());
        }
    };

    let hashes = settings
        .compute_hash
        .then(|| core_imgops::rotated_hashes(&pixels, settings.target, settings.shift_amount));

    if settings.compress {
        let thumb_path = settings.thumb_dir.join(format!("{}.png", arg.key));
        if let Err(err) = core_imgops::store_thumbnail(&pixels, target, &thumb_path) {
            debug!(target: "workers", key = arg.key, error = %err, "preprocess_store_failed");
            return PreprocessResult::failure(arg.key, err.to_string());
        }
    }

    PreprocessResult {
        key: arg.key,
        org_x: org_x as i64,
        org_y: org_y as i64,
        hashes,
        error: None,
    }
}

/// One preprocessing worker thread body.
pub struct FirstLoopWorker {
    id: usize,
    settings: Arc<FirstLoopSettings>,
    cmd: Receiver<Option<FirstLoopCmd>>,
    out: Sender<Option<Vec<PreprocessResult>>>,
}

impl FirstLoopWorker {
    pub fn new(
        id: usize,
        settings: Arc<FirstLoopSettings>,
        cmd: Receiver<Option<FirstLoopCmd>>,
        out: Sender<Option<Vec<PreprocessResult>>>,
    ) -> Self {
        Self {
            id,
            settings,
            cmd,
            out,
        }
    }

    /// Consume commands until shutdown, disconnect, or idle timeout. Always
    /// emits the `None` sentinel on the way out.
    pub fn run(self) {
        let mut starved = Duration::ZERO;
        loop {
            match self.cmd.recv_timeout(POLL_INTERVAL) {
                Ok(Some(cmd)) => {
                    starved = Duration::ZERO;
                    let results = match cmd {
                        FirstLoopCmd::Single(arg) => vec![preprocess(&self.settings, &arg)],
                        FirstLoopCmd::Batch(args) => args
                            .iter()
                            .map(|arg| preprocess(&self.settings, arg))
                            .collect(),
                    };
                    if self.out.send(Some(results)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!(target: "workers", id = self.id, "first_loop_worker_shutdown");
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    starved += POLL_INTERVAL;
                    if starved >= self.settings.timeout {
                        warn!(target: "workers", id = self.id, "first_loop_worker_starved");
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let _ = self.out.send(None);
    }
}
