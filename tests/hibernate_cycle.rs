//! End-to-end hibernate cycle through the public facade
//!
//! Uses a config file on disk, the thread launcher and the in-memory host.

use hibernator::durability::testing::MemoryHost;
use hibernator::{
    ControlSignals, FileConfigSource, HibernatorConfig, Orchestrator, OrchestratorState,
    PageKey, RunOutcome, ThreadLauncher, CONFIG_FILE_NAME,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn host() -> MemoryHost {
    let host = MemoryHost::new(16);
    host.add_database(5, "postgres");
    host.add_database(16384, "app");
    host.add_relation("app", 40000, 40000, &[(0, 500), (1, 3)]);
    host
}

fn orchestrator(host: &MemoryHost, data_dir: &TempDir) -> Orchestrator<ThreadLauncher> {
    let signals = ControlSignals::new();
    let launcher = ThreadLauncher::new(Arc::new(host.clone()), signals.clone());
    Orchestrator::new(
        Box::new(FileConfigSource::in_dir(data_dir.path())),
        launcher,
        signals,
        Arc::new(host.clone()),
        Arc::new(host.clone()),
    )
    .unwrap()
}

#[test]
fn test_hibernate_and_wake() {
    let data_dir = TempDir::new().unwrap();
    let save_dir = data_dir.path().join("pg_hibernator");
    std::fs::write(
        data_dir.path().join(CONFIG_FILE_NAME),
        format!(
            "save_dir = {:?}\npoll_interval_ms = 10\n",
            save_dir.to_str().unwrap()
        ),
    )
    .unwrap();

    let pages: Vec<PageKey> = (0..200)
        .map(|b| PageKey::new(16384, 40000, 0, b * 2))
        .chain(Some(PageKey::new(16384, 40000, 1, 2)))
        .collect();

    // Shut down with a warm cache
    let warm = host();
    warm.load_pages(&pages);
    warm.add_empty_slots(64);
    let mut first = orchestrator(&warm, &data_dir);
    assert_eq!(first.config().save_dir, save_dir);
    first.signals().request_shutdown();
    assert!(matches!(first.run().unwrap(), RunOutcome::Saved(_)));
    assert!(save_dir.join("2.app.save").exists());

    // Start cold and wait for the restore to finish
    let cold = host();
    let mut second = orchestrator(&cold, &data_dir);
    assert_eq!(second.discover().unwrap(), 1);

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        second.step();
        if second.state() == OrchestratorState::Idle {
            break;
        }
        assert!(Instant::now() < deadline);
        second.signals().wait(Duration::from_millis(10));
        second.signals().latch().reset();
    }

    assert_eq!(cold.reads().len(), pages.len());
    assert!(!save_dir.join("2.app.save").exists());
}

#[test]
fn test_default_config_file_round_trips() {
    let data_dir = TempDir::new().unwrap();
    let path = data_dir.path().join(CONFIG_FILE_NAME);
    HibernatorConfig::write_default_if_missing(&path).unwrap();

    assert_eq!(
        HibernatorConfig::from_file(&path).unwrap(),
        HibernatorConfig::default()
    );
}
