//! Shutdown and restart through the orchestrator
//!
//! These tests run the real control loop with thread-backed workers:
//! - A shutdown writes save-files that the next start restores and removes
//! - Restore jobs run one at a time unless parallel mode is on
//! - A broken save-file does not block the rest of the queue

use hibernator_core::{JobId, PageKey, INVALID_OID};
use hibernator_durability::testing::MemoryHost;
use hibernator_engine::{
    ControlSignals, HibernatorConfig, Orchestrator, OrchestratorState, RunOutcome,
    StaticConfigSource, ThreadLauncher,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const ALPHA: u32 = 16384;
const BETA: u32 = 16385;

fn host() -> MemoryHost {
    let host = MemoryHost::new(4);
    host.add_database(5, "postgres");
    host.add_database(ALPHA, "alpha");
    host.add_database(BETA, "beta");
    host.add_relation("postgres", 1262, 1262, &[(0, 4)]);
    host.add_relation("alpha", 20, 20, &[(0, 100)]);
    host.add_relation("beta", 30, 30, &[(0, 100), (1, 2)]);
    host
}

fn config(dir: &TempDir, parallel: bool) -> HibernatorConfig {
    HibernatorConfig {
        parallel,
        save_dir: dir.path().join("pg_hibernator"),
        poll_interval_ms: 10,
        ..HibernatorConfig::default()
    }
}

fn orchestrator(host: &MemoryHost, config: HibernatorConfig) -> Orchestrator<ThreadLauncher> {
    let signals = ControlSignals::new();
    let launcher = ThreadLauncher::new(Arc::new(host.clone()), signals.clone());
    Orchestrator::new(
        Box::new(StaticConfigSource::new(config)),
        launcher,
        signals,
        Arc::new(host.clone()),
        Arc::new(host.clone()),
    )
    .unwrap()
}

/// Step the orchestrator until every job has run
fn drain(orch: &mut Orchestrator<ThreadLauncher>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        orch.step();
        if orch.state() == OrchestratorState::Idle {
            return;
        }
        assert!(Instant::now() < deadline, "restore jobs did not finish");
        orch.signals().latch().reset();
        orch.signals().wait(Duration::from_millis(10));
    }
}

fn saved_pages() -> Vec<PageKey> {
    let mut pages = vec![PageKey::new(INVALID_OID, 1262, 0, 0)];
    pages.extend((0..30).map(|b| PageKey::new(ALPHA, 20, 0, b)));
    pages.extend((10..20).map(|b| PageKey::new(BETA, 30, 0, b)));
    pages.push(PageKey::new(BETA, 30, 1, 1));
    pages
}

#[test]
fn test_shutdown_then_restart_rewarms_cache() {
    let dir = TempDir::new().unwrap();

    // First run: cache is warm, shut down
    let before = host();
    before.load_pages(&saved_pages());
    let mut first = orchestrator(&before, config(&dir, false));
    first.signals().request_shutdown();
    let summary = match first.run().unwrap() {
        RunOutcome::Saved(summary) => summary,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(summary.files.len(), 3);
    assert_eq!(summary.pages_saved, saved_pages().len());

    // Second run: cold cache, restore everything
    let after = host();
    let mut second = orchestrator(&after, config(&dir, false));
    assert_eq!(second.discover().unwrap(), 3);
    drain(&mut second);

    assert_eq!(after.reads().len(), saved_pages().len());
    assert!(second.save_dir().list_pending().unwrap().is_empty());
}

#[test]
fn test_parallel_restore_runs_every_job() {
    let dir = TempDir::new().unwrap();
    let before = host();
    before.load_pages(&saved_pages());
    orchestrator(&before, config(&dir, false)).save().unwrap();

    let after = host();
    let mut orch = orchestrator(&after, config(&dir, true));
    orch.discover().unwrap();
    orch.step();
    assert_eq!(orch.pending_jobs().count(), 0);

    drain(&mut orch);
    assert_eq!(after.reads().len(), saved_pages().len());
}

#[test]
fn test_broken_save_file_does_not_block_queue() {
    let dir = TempDir::new().unwrap();
    let before = host();
    before.load_pages(&saved_pages());
    orchestrator(&before, config(&dir, false)).save().unwrap();

    // Truncate alpha's file inside its first payload
    let alpha = dir.path().join("pg_hibernator").join("2.alpha.save");
    std::fs::write(&alpha, [b'r', 0x14]).unwrap();

    let after = host();
    let mut orch = orchestrator(&after, config(&dir, false));
    orch.discover().unwrap();
    drain(&mut orch);

    // Global and beta restored, alpha kept for inspection
    assert_eq!(after.reads().len(), 1 + 10 + 1);
    assert!(alpha.exists());
    let left: Vec<JobId> = orch
        .save_dir()
        .list_pending()
        .unwrap()
        .into_iter()
        .map(|job| job.job_id)
        .collect();
    assert_eq!(left, vec![JobId::new(2)]);
}

#[test]
fn test_control_loop_on_its_own_thread() {
    let dir = TempDir::new().unwrap();
    let before = host();
    before.load_pages(&saved_pages());
    orchestrator(&before, config(&dir, false)).save().unwrap();

    let after = host();
    let mut orch = orchestrator(&after, config(&dir, false));
    let signals = orch.signals().clone();
    let reads = after.clone();

    let control = thread::spawn(move || orch.run());

    let deadline = Instant::now() + Duration::from_secs(10);
    while reads.reads().len() < saved_pages().len() {
        assert!(Instant::now() < deadline, "cache was not re-warmed");
        thread::sleep(Duration::from_millis(5));
    }
    signals.request_shutdown();

    let outcome = control.join().unwrap().unwrap();
    match outcome {
        // The restored cache is empty in this host, so the shutdown save
        // writes nothing
        RunOutcome::Saved(summary) => assert_eq!(summary.pages_saved, 0),
        other => panic!("unexpected outcome {:?}", other),
    }
}
