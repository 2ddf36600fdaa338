//! End-to-end pipeline runs over generated image sets.

use core_config::{Config, Progress};
use core_engine::{DifEngine, EngineError};
use std::path::Path;

const TARGET: u32 = 16;

fn write_uniform(dir: &Path, name: &str, edge_x: u32, edge_y: u32, fill: u8) {
    let pixels = vec![fill; (edge_x * edge_y) as usize * core_imgops::CHANNELS];
    core_imgops::store_thumbnail(&pixels, (edge_x, edge_y), &dir.join(name)).unwrap();
}

fn base_config(root: &Path) -> Config {
    let mut config = Config::new(vec![root.to_path_buf()], Vec::new());
    config.compression_target = TARGET;
    config.cpu_proc = 2;
    config
}

fn run(config: Config) -> DifEngine {
    let mut engine = DifEngine::fresh(config).unwrap();
    engine.run_to_completion().unwrap();
    assert_eq!(engine.state(), Progress::SecondLoopDone);
    engine
}

#[test]
fn identical_files_short_circuit_on_hash() {
    let dir = tempfile::tempdir().unwrap();
    // Eight visually distinct images plus one byte-identical pair.
    for i in 0..8u32 {
        write_uniform(dir.path(), &format!("img_{i}.png"), 16, 16, (i * 11 + 40) as u8);
    }
    write_uniform(dir.path(), "dup_a.png", 16, 16, 201);
    write_uniform(dir.path(), "dup_b.png", 16, 16, 201);

    let mut config = base_config(dir.path());
    config.first_loop.compute_hash = true;
    config.first_loop.shift_amount = 0;
    config.second_loop.skip_matching_hash = true;
    config.second_loop.diff_threshold = 1.0;
    let engine = run(config);

    let pairs = engine.diff_pairs(None, true).unwrap();
    assert_eq!(pairs.len(), 1);
    let (path_a, path_b, dif) = &pairs[0];
    // Key assignment follows directory order, so either twin may come
    // first.
    let mut names = [path_a.as_str(), path_b.as_str()].map(|p| {
        Path::new(p)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    names.sort();
    assert_eq!(names, ["dup_a.png".to_string(), "dup_b.png".to_string()]);
    assert_eq!(*dif, 0.0);

    // The hash-matched pair is invisible without the opt-in.
    assert!(engine.diff_pairs(None, false).unwrap().is_empty());
}

#[test]
fn aspect_mismatches_skip_the_diff() {
    let dir = tempfile::tempdir().unwrap();
    write_uniform(dir.path(), "sq_a.png", 64, 64, 10);
    write_uniform(dir.path(), "sq_b.png", 64, 64, 30);
    write_uniform(dir.path(), "wide.png", 64, 32, 50);
    write_uniform(dir.path(), "tall.png", 32, 64, 70);

    let mut config = base_config(dir.path());
    config.second_loop.match_aspect_by = Some(0.0);
    config.second_loop.diff_threshold = 1_000_000_000.0;
    let engine = run(config);

    // Of the six pairs, only the two equal-aspect ones are diffed: the
    // square pair and the wide/tall pair (2:1 either way up).
    let pairs = engine.diff_pairs(None, false).unwrap();
    assert_eq!(pairs.len(), 2);
    assert_eq!(engine.diff_row_count().unwrap(), 2);
}

#[test]
fn aspect_sentinels_can_be_retained() {
    let dir = tempfile::tempdir().unwrap();
    write_uniform(dir.path(), "sq_a.png", 64, 64, 10);
    write_uniform(dir.path(), "sq_b.png", 64, 64, 30);
    write_uniform(dir.path(), "wide.png", 64, 32, 50);
    write_uniform(dir.path(), "tall.png", 32, 64, 70);

    let mut config = base_config(dir.path());
    config.second_loop.match_aspect_by = Some(0.0);
    config.second_loop.keep_non_matching_aspects = true;
    config.second_loop.diff_threshold = 1_000_000_000.0;
    let engine = run(config);

    // Two computed rows plus four mismatch sentinels.
    assert_eq!(engine.diff_row_count().unwrap(), 6);
    assert_eq!(engine.diff_pairs(None, false).unwrap().len(), 2);
}

#[test]
fn two_partitions_cover_the_full_rectangle() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    for i in 0..3u32 {
        write_uniform(dir_a.path(), &format!("a_{i}.png"), 16, 16, (i * 7) as u8);
    }
    for i in 0..5u32 {
        write_uniform(dir_b.path(), &format!("b_{i}.png"), 16, 16, (100 + i * 7) as u8);
    }

    let mut config = Config::new(
        vec![dir_a.path().to_path_buf()],
        vec![dir_b.path().to_path_buf()],
    );
    config.compression_target = TARGET;
    config.cpu_proc = 2;
    config.second_loop.batch_size = Some(2);
    config.second_loop.diff_threshold = 1_000_000_000.0;
    let engine = run(config);

    // ceil(3/2) x ceil(5/2) = 6 blocks covering all 15 ordered pairs.
    let pairs = engine.diff_pairs(None, false).unwrap();
    assert_eq!(pairs.len(), 15);
    for (path_a, path_b, _) in &pairs {
        assert!(Path::new(path_a).starts_with(dir_a.path()));
        assert!(Path::new(path_b).starts_with(dir_b.path()));
    }
}

#[test]
fn rotation_search_finds_turned_duplicates() {
    let make_pair = |dir: &Path| {
        let edge = TARGET as usize;
        let mut pixels = vec![0u8; edge * edge * core_imgops::CHANNELS];
        for (i, px) in pixels.iter_mut().enumerate() {
            *px = (i % 239) as u8;
        }
        let turned = core_imgops::rotate90(&core_imgops::rotate90(&pixels, TARGET), TARGET);
        core_imgops::store_thumbnail(&pixels, (TARGET, TARGET), &dir.join("orig.png")).unwrap();
        core_imgops::store_thumbnail(&turned, (TARGET, TARGET), &dir.join("turned.png")).unwrap();
    };

    let dir = tempfile::tempdir().unwrap();
    make_pair(dir.path());
    let mut config = base_config(dir.path());
    config.rotate = true;
    config.second_loop.diff_threshold = 1.0;
    let engine = run(config);
    let pairs = engine.diff_pairs(None, false).unwrap();
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].2, 0.0);

    // Without the rotation search the pair is not a duplicate.
    let dir = tempfile::tempdir().unwrap();
    make_pair(dir.path());
    let mut config = base_config(dir.path());
    config.rotate = false;
    config.second_loop.diff_threshold = 1.0;
    let engine = run(config);
    assert!(engine.diff_pairs(None, false).unwrap().is_empty());
}

#[test]
fn finished_runs_resume_to_identical_results() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..6u32 {
        write_uniform(dir.path(), &format!("img_{i}.png"), 16, 16, (i * 31) as u8);
    }
    write_uniform(dir.path(), "twin_a.png", 16, 16, 222);
    write_uniform(dir.path(), "twin_b.png", 16, 16, 222);

    let mut config = base_config(dir.path());
    config.first_loop.compute_hash = true;
    config.first_loop.shift_amount = 0;
    config.second_loop.skip_matching_hash = true;
    config.second_loop.diff_threshold = 1.0;

    let first_pairs = {
        let engine = run(config.clone());
        engine.diff_pairs(None, true).unwrap()
    };

    // Reopening without purge lands on the completed state and changes
    // nothing.
    let mut engine = DifEngine::open(config.clone(), false).unwrap();
    assert_eq!(engine.state(), Progress::SecondLoopDone);
    engine.run_to_completion().unwrap();
    assert_eq!(engine.diff_pairs(None, true).unwrap(), first_pairs);
    drop(engine);

    // Even replaying from an earlier persisted state converges to the same
    // rows: replayed pairs hit the unique pair index and are dropped.
    let task_path = dir.path().join(core_config::TASK_FILE);
    let mut replay = Config::load(&task_path).unwrap();
    replay.state = Progress::FirstLoopDone;
    replay.save(&task_path).unwrap();

    let mut engine = DifEngine::open(config, false).unwrap();
    assert_eq!(engine.state(), Progress::FirstLoopDone);
    engine.run_to_completion().unwrap();
    assert_eq!(engine.state(), Progress::SecondLoopDone);
    assert_eq!(engine.diff_pairs(None, true).unwrap(), first_pairs);
}

#[test]
fn clusters_and_reduction_respect_thresholds() {
    let dir = tempfile::tempdir().unwrap();
    write_uniform(dir.path(), "a.png", 16, 16, 10);
    write_uniform(dir.path(), "b.png", 16, 16, 11);
    write_uniform(dir.path(), "c.png", 16, 16, 12);

    let mut engine = run(base_config(dir.path()));
    // The three fills differ by 1, 1 and 2, so the squared diffs are
    // 1, 1 and 4 in some key order.
    assert_eq!(engine.diff_row_count().unwrap(), 3);
    assert_eq!(engine.diff_pairs(Some(2.0), false).unwrap().len(), 2);

    let clusters = engine.diff_clusters(Some(2.0), true, false).unwrap();
    let peers: usize = clusters.iter().map(|(_, members)| members.len()).sum();
    assert_eq!(peers, 2);
    assert!(!clusters.is_empty() && clusters.len() <= 2);

    // Dropping above 1.5 removes exactly the dif=4 row.
    let dropped = engine.reduce_diff(1.5).unwrap();
    assert_eq!(dropped, 1);
    assert_eq!(engine.diff_row_count().unwrap(), 2);
}

#[test]
fn interrupted_engine_persists_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    write_uniform(dir.path(), "a.png", 16, 16, 10);

    let mut engine = DifEngine::fresh(base_config(dir.path())).unwrap();
    engine
        .run_flag()
        .store(false, std::sync::atomic::Ordering::SeqCst);
    match engine.run_to_completion() {
        Err(EngineError::Interrupted) => {}
        other => panic!("expected interrupt, got {other:?}"),
    }
    assert_eq!(engine.state(), Progress::Init);
    assert!(dir.path().join(core_config::TASK_FILE).exists());
}

#[test]
fn storage_report_reflects_partitions() {
    let dir = tempfile::tempdir().unwrap();
    write_uniform(dir.path(), "a.png", 16, 16, 10);
    write_uniform(dir.path(), "b.png", 16, 16, 20);
    std::fs::write(dir.path().join("notes.txt"), b"not an image").unwrap();

    let mut engine = DifEngine::fresh(base_config(dir.path())).unwrap();
    engine.full_index().unwrap();
    let report = engine.storage_report().unwrap();
    assert_eq!(report.a_allowed, 2);
    assert!(report.a_total >= 3);
    assert_eq!(report.b_allowed, 0);
    assert_eq!(
        report.thumb_bytes,
        2 * u64::from(TARGET) * u64::from(TARGET) * core_imgops::CHANNELS as u64
    );
}
