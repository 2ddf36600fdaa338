//! picdup entrypoint.

use anyhow::Result;
use clap::Parser;
use core_config::Config;
use core_engine::{DifEngine, EngineError};
use std::path::{Path, PathBuf};
use std::sync::Once;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(
    name = "picdup",
    version,
    about = "Find visually duplicate images across directory trees"
)]
struct Args {
    /// Roots of partition A.
    #[arg(required = true)]
    part_a: Vec<PathBuf>,
    /// Roots of partition B; compares A against B instead of within A.
    #[arg(long = "part-b")]
    part_b: Vec<PathBuf>,
    /// Stay at the top level of each root instead of recursing.
    #[arg(long)]
    no_recurse: bool,
    /// Thumbnail edge in pixels; all comparisons happen at this size.
    #[arg(long, default_value_t = 64)]
    size: u32,
    /// Similarity threshold; pairs at or above it are discarded.
    #[arg(long, default_value_t = 200.0)]
    similarity: f32,
    /// Also accept duplicates rotated by 90/180/270 degrees.
    #[arg(long)]
    rotate: bool,
    /// Cheap mode: exact-match hashing plus the aspect-ratio short-circuit.
    #[arg(long)]
    lazy: bool,
    /// Worker count for both loops (defaults to the CPU count).
    #[arg(long)]
    processes: Option<usize>,
    /// Block edge of the comparison plan (auto when omitted).
    #[arg(long)]
    chunk: Option<usize>,
    /// Discard any progress a previous run left behind.
    #[arg(long)]
    purge: bool,
    /// Print clusters around a shared anchor instead of flat pairs.
    #[arg(long)]
    clusters: bool,
    /// Keep the catalog, thumbnails and task file after a finished run.
    #[arg(long)]
    keep_artifacts: bool,
    /// Write logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn configure_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let name = path
                .file_name()
                .map(|n| n.to_owned())
                .unwrap_or_else(|| "picdup.log".into());
            let appender =
                tracing_appender::rolling::never(dir.unwrap_or(Path::new(".")), name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!(target: "runtime.panic", ?info, "panic");
            default_panic(info);
        }));
    });
}

fn build_config(args: &Args) -> Config {
    let mut config = Config::new(args.part_a.clone(), args.part_b.clone());
    config.recurse = !args.no_recurse;
    config.compression_target = args.size;
    config.rotate = args.rotate;
    config.second_loop.diff_threshold = args.similarity;
    if let Some(processes) = args.processes {
        config.cpu_proc = processes;
    }
    if let Some(chunk) = args.chunk {
        config.second_loop.batch_size = Some(chunk);
    }
    if args.lazy {
        config.first_loop.compute_hash = true;
        config.first_loop.shift_amount = 0;
        config.second_loop.skip_matching_hash = true;
        config.second_loop.match_aspect_by = Some(0.0);
    }
    // The run stays resumable until it finishes; cleanup happens at the
    // end according to --keep-artifacts.
    config.retain_progress = true;
    config.delete_db = false;
    config.delete_thumb = false;
    config
}

fn print_results(engine: &DifEngine, args: &Args) -> Result<()> {
    // In lazy mode the exact duplicates are the hash-matched rows.
    let include_hash_match = args.lazy;
    if args.clusters {
        for (anchor, peers) in engine.diff_clusters(None, true, include_hash_match)? {
            println!("{anchor}");
            for (peer, dif) in peers {
                println!("  {dif:.4}\t{peer}");
            }
        }
    } else {
        for (path_a, path_b, dif) in engine.diff_pairs(None, include_hash_match)? {
            println!("{dif:.4}\t{path_a}\t{path_b}");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = configure_logging(args.log_file.as_deref())?;
    install_panic_hook();
    info!(target: "runtime", "startup");

    let config = build_config(&args);
    let mut engine = DifEngine::open(config, args.purge)?;
    if let Err(err) = engine.install_sigint_handler() {
        warn!(target: "runtime", error = %err, "sigint_handler_unavailable");
    }

    match engine.run_to_completion() {
        Ok(()) => {}
        Err(EngineError::Interrupted) => {
            eprintln!("interrupted; progress saved, rerun without --purge to resume");
            std::process::exit(130);
        }
        Err(err) => return Err(err.into()),
    }

    let report = engine.storage_report()?;
    info!(
        target: "runtime",
        a_files = report.a_total,
        a_allowed = report.a_allowed,
        b_files = report.b_total,
        b_allowed = report.b_allowed,
        thumb_bytes = report.thumb_bytes,
        pairs = engine.diff_row_count()?,
        "run_complete"
    );

    print_results(&engine, &args)?;

    if args.keep_artifacts {
        info!(target: "runtime", "artifacts_retained_for_resume");
    } else {
        engine.set_cleanup_policy(false, true, true);
        engine.cleanup()?;
    }
    Ok(())
}
