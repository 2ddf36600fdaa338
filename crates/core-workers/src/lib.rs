//! Worker pools for the two pipeline loops.
//!
//! Workers are plain OS threads fed over crossbeam channels. The protocol
//! is symmetric for both loops: the orchestrator sends `Some(work)` until
//! it is done, then one `None` per worker; a worker answers every unit of
//! work with `Some(result)` and acknowledges shutdown (or an idle timeout)
//! with a final `None` sentinel before its thread ends. The orchestrator
//! counts sentinels to know when the pool has drained.
//!
//! Workers never touch the catalog; all persistence happens on the
//! orchestrator side of the result channel.

mod first_loop;
mod messages;
mod second_loop;

pub use first_loop::{FirstLoopSettings, FirstLoopWorker, preprocess};
pub use messages::{
    FirstLoopCmd, PreprocessArg, PreprocessResult, SecondLoopArgs, SecondLoopResults, outcome,
};
pub use second_loop::{DiffFn, SecondLoopSettings, SecondLoopWorker, cpu_diff};

use std::time::Duration;

/// How often an idle worker re-checks its command channel.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);
