//! Restore orchestration and shutdown save
//!
//! The orchestrator is the long-lived control loop. At startup it turns
//! every save-file into a pending restore job and hands jobs to workers in
//! FIFO order: one at a time by default, or as fast as workers can be started
//! in parallel mode. At shutdown it abandons whatever is still queued and
//! saves the cache once.
//!
//! ## State machine
//!
//! ```text
//! Idle ──discover──▶ Dispatching ──launch──▶ Waiting
//!  ▲                      ▲                     │
//!  └── queue empty ───────┴──── job finished ───┘
//!
//! any of the above ──shutdown──▶ Saving ──▶ Stopped
//! ```

use crate::config::{ConfigSource, HibernatorConfig};
use crate::launcher::{JobStatus, RestoreRequest, WorkerLauncher};
use crate::signals::ControlSignals;
use hibernator_core::{BufferPool, PendingJob, Result, SessionProvider};
use hibernator_durability::{SaveDirectory, SaveSummary, Snapshotter};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where the orchestrator is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Nothing queued and nothing running
    Idle,
    /// A queued job can be started at the next decision point
    Dispatching,
    /// Waiting for a running job before starting another
    Waiting,
    /// Writing save-files for shutdown
    Saving,
    /// The control loop has ended
    Stopped,
}

/// How [`Orchestrator::run`] ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Shutdown was requested and the cache was saved
    Saved(SaveSummary),
    /// Shutdown was requested while disabled, so nothing was saved
    SaveSkipped,
    /// The host died; nothing was saved
    HostDied,
}

struct ActiveJob<H> {
    job: PendingJob,
    handle: H,
}

/// Control loop for restore jobs and the shutdown save.
pub struct Orchestrator<L: WorkerLauncher> {
    config: HibernatorConfig,
    config_source: Box<dyn ConfigSource>,
    save_dir: SaveDirectory,
    launcher: L,
    signals: ControlSignals,
    buffers: Arc<dyn BufferPool>,
    sessions: Arc<dyn SessionProvider>,
    pending: VecDeque<PendingJob>,
    active: Vec<ActiveJob<L::Handle>>,
    state: OrchestratorState,
}

impl<L: WorkerLauncher> Orchestrator<L> {
    /// Load configuration and open the save directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the save location exists
    /// but is not a directory.
    pub fn new(
        config_source: Box<dyn ConfigSource>,
        launcher: L,
        signals: ControlSignals,
        buffers: Arc<dyn BufferPool>,
        sessions: Arc<dyn SessionProvider>,
    ) -> Result<Self> {
        let config = config_source.load()?;
        let save_dir = SaveDirectory::open(&config.save_dir).map_err(|e| {
            error!(error = %e, "Could not open save directory");
            e
        })?;

        Ok(Orchestrator {
            config,
            config_source,
            save_dir,
            launcher,
            signals,
            buffers,
            sessions,
            pending: VecDeque::new(),
            active: Vec::new(),
            state: OrchestratorState::Idle,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Current state
    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Jobs waiting to be started, in dispatch order
    pub fn pending_jobs(&self) -> impl Iterator<Item = &PendingJob> {
        self.pending.iter()
    }

    /// Jobs started and not yet seen finished
    pub fn active_jobs(&self) -> impl Iterator<Item = &PendingJob> {
        self.active.iter().map(|active| &active.job)
    }

    /// Configuration in effect
    pub fn config(&self) -> &HibernatorConfig {
        &self.config
    }

    /// The save directory
    pub fn save_dir(&self) -> &SaveDirectory {
        &self.save_dir
    }

    /// Signals this orchestrator listens to
    pub fn signals(&self) -> &ControlSignals {
        &self.signals
    }

    /// The worker launcher
    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    // ========================================================================
    // Restore
    // ========================================================================

    /// Queue a restore job for every save-file in the directory.
    ///
    /// Does nothing while disabled. Returns the number of jobs queued.
    pub fn discover(&mut self) -> Result<usize> {
        if !self.config.enabled {
            debug!("Hibernation disabled, not restoring save-files");
            return Ok(0);
        }

        let jobs = self.save_dir.list_pending().map_err(|e| {
            error!(path = %self.save_dir.path().display(), error = %e, "Could not list save directory");
            e
        })?;

        let count = jobs.len();
        for job in jobs {
            self.enqueue(job);
        }

        info!(jobs = count, "Discovered save-files");
        Ok(count)
    }

    /// Append a job to the back of the queue.
    ///
    /// A job whose id is already queued or running is ignored.
    pub fn enqueue(&mut self, job: PendingJob) {
        let known = self.pending.iter().any(|p| p.job_id == job.job_id)
            || self.active.iter().any(|a| a.job.job_id == job.job_id);
        if known {
            warn!(job_id = %job.job_id, "Ignoring job already known to the orchestrator");
            return;
        }

        debug!(job_id = %job.job_id, database = %job.database_name, "Queued restore job");
        self.pending.push_back(job);
        self.refresh_state();
    }

    /// One decision point.
    ///
    /// Retires finished workers, then starts the job at the head of the
    /// queue if nothing is running, or every queued job in parallel mode.
    /// A job whose worker cannot be started stays at the head of the queue.
    pub fn step(&mut self) {
        self.retire_finished();

        if self.config.enabled {
            self.dispatch();
        }

        self.refresh_state();
    }

    fn retire_finished(&mut self) {
        let launcher = &self.launcher;
        self.active.retain(|active| match launcher.status(&active.handle) {
            JobStatus::Running => true,
            JobStatus::Finished => {
                debug!(job_id = %active.job.job_id, "Block Reader {} exited", active.job.job_id);
                false
            }
        });
    }

    /// Cancel running workers and wait until every one has exited.
    ///
    /// Returns false if the host died first.
    fn wait_for_workers(&mut self) -> bool {
        self.signals.cancel_flag().cancel();

        loop {
            // Reset before polling: an exit after the poll sets it again
            self.signals.latch().reset();
            self.retire_finished();
            if self.active.is_empty() {
                return true;
            }

            debug!(active = self.active.len(), "Waiting for Block Readers to exit");
            if self.signals.wait(self.config.poll_interval()).host_died {
                return false;
            }
        }
    }

    fn dispatch(&mut self) {
        while let Some(job) = self.pending.front() {
            if !self.active.is_empty() && !self.config.parallel {
                break;
            }

            let request = RestoreRequest {
                job: job.clone(),
                save_dir: self.save_dir.clone(),
                default_database: self.config.default_database.clone(),
            };

            match self.launcher.launch(request) {
                Ok(handle) => {
                    if let Some(job) = self.pending.pop_front() {
                        info!(job_id = %job.job_id, database = %job.database_name, "Registered Block Reader {}", job.job_id);
                        self.active.push(ActiveJob { job, handle });
                    }
                }
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "Could not start restore job, will retry");
                    break;
                }
            }
        }
    }

    fn refresh_state(&mut self) {
        self.state = if !self.pending.is_empty() && (self.active.is_empty() || self.config.parallel)
        {
            OrchestratorState::Dispatching
        } else if !self.active.is_empty() {
            OrchestratorState::Waiting
        } else {
            OrchestratorState::Idle
        };
    }

    /// Reread configuration.
    ///
    /// Only the reloadable settings change. On error the current
    /// configuration stays in effect.
    pub fn reload(&mut self) -> Result<()> {
        let new = self.config_source.load()?;
        self.config.apply_reload(new);
        self.refresh_state();
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Run until shutdown or host death.
    ///
    /// Discovers save-files, then alternates between a decision point and a
    /// bounded wait for the next signal. On shutdown the cache is saved if
    /// enabled.
    pub fn run(&mut self) -> Result<RunOutcome> {
        self.discover()?;

        loop {
            self.signals.latch().reset();
            if self.signals.shutdown_requested() {
                break;
            }

            self.step();

            let events = self.signals.wait(self.config.poll_interval());
            if events.host_died {
                error!("Host process died, exiting without saving");
                self.state = OrchestratorState::Stopped;
                return Ok(RunOutcome::HostDied);
            }

            if self.signals.take_reload() {
                if let Err(e) = self.reload() {
                    warn!(error = %e, "Could not reload configuration, keeping current settings");
                }
            }
        }

        self.shutdown()
    }

    /// Abandon queued jobs and save the cache if enabled.
    ///
    /// Running workers are cancelled, and the save starts only once all of
    /// them have exited, so none can delete a save-file written for this
    /// shutdown. If the host dies meanwhile, nothing is saved.
    pub fn shutdown(&mut self) -> Result<RunOutcome> {
        self.state = OrchestratorState::Saving;

        if !self.pending.is_empty() || !self.active.is_empty() {
            debug!(
                pending = self.pending.len(),
                active = self.active.len(),
                "Abandoning restore jobs for shutdown"
            );
        }
        self.pending.clear();

        if !self.wait_for_workers() {
            error!("Host process died during shutdown, exiting without saving");
            self.state = OrchestratorState::Stopped;
            return Ok(RunOutcome::HostDied);
        }

        let outcome = if self.config.enabled {
            self.save().map(RunOutcome::Saved)
        } else {
            debug!("Hibernation disabled, not saving buffers");
            Ok(RunOutcome::SaveSkipped)
        };

        self.state = OrchestratorState::Stopped;
        outcome
    }

    /// Scan the cache and write save-files
    pub fn save(&self) -> Result<SaveSummary> {
        let saver = Snapshotter::new(
            self.buffers.as_ref(),
            self.sessions.as_ref(),
            &self.save_dir,
            &self.config.default_database,
        );
        saver.scan_and_persist().map_err(|e| {
            error!(path = ?e.path(), error = %e, "Buffer Saver: could not save buffers");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfigSource;
    use hibernator_core::{Error, JobId, PageKey};
    use hibernator_durability::testing::MemoryHost;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use tempfile::TempDir;

    /// Launcher whose jobs finish only when told to
    #[derive(Clone, Default)]
    struct ScriptedLauncher {
        launched: Arc<Mutex<Vec<JobId>>>,
        finished: Arc<Mutex<HashSet<JobId>>>,
        refuse: Arc<Mutex<usize>>,
    }

    impl ScriptedLauncher {
        fn finish(&self, id: u32) {
            self.finished.lock().insert(JobId::new(id));
        }

        fn launched(&self) -> Vec<u32> {
            self.launched.lock().iter().map(|id| id.as_u32()).collect()
        }

        fn refuse_next(&self, count: usize) {
            *self.refuse.lock() = count;
        }
    }

    impl WorkerLauncher for ScriptedLauncher {
        type Handle = JobId;

        fn launch(&mut self, request: RestoreRequest) -> Result<JobId> {
            let mut refuse = self.refuse.lock();
            if *refuse > 0 {
                *refuse -= 1;
                return Err(Error::host("no free worker slots"));
            }
            self.launched.lock().push(request.job.job_id);
            Ok(request.job.job_id)
        }

        fn status(&self, handle: &JobId) -> JobStatus {
            if self.finished.lock().contains(handle) {
                JobStatus::Finished
            } else {
                JobStatus::Running
            }
        }
    }

    fn config(dir: &TempDir, parallel: bool) -> HibernatorConfig {
        HibernatorConfig {
            parallel,
            save_dir: dir.path().join("saves"),
            poll_interval_ms: 20,
            ..HibernatorConfig::default()
        }
    }

    fn orchestrator(
        config: HibernatorConfig,
        launcher: ScriptedLauncher,
    ) -> (Orchestrator<ScriptedLauncher>, MemoryHost) {
        let host = MemoryHost::new(2);
        host.add_database(5, "postgres");
        let orchestrator = Orchestrator::new(
            Box::new(StaticConfigSource::new(config)),
            launcher,
            ControlSignals::new(),
            Arc::new(host.clone()),
            Arc::new(host.clone()),
        )
        .unwrap();
        (orchestrator, host)
    }

    fn job(id: u32) -> PendingJob {
        PendingJob::new(JobId::new(id), format!("db{}", id))
    }

    fn pending_ids(orch: &Orchestrator<ScriptedLauncher>) -> Vec<u32> {
        orch.pending_jobs().map(|j| j.job_id.as_u32()).collect()
    }

    #[test]
    fn test_fifo_one_at_a_time() {
        let dir = TempDir::new().unwrap();
        let launcher = ScriptedLauncher::default();
        let (mut orch, _host) = orchestrator(config(&dir, false), launcher.clone());

        for id in [2, 3, 4] {
            orch.enqueue(job(id));
        }
        assert_eq!(orch.state(), OrchestratorState::Dispatching);

        orch.step();
        assert_eq!(launcher.launched(), vec![2]);
        assert_eq!(orch.state(), OrchestratorState::Waiting);

        // Job 2 still running: nothing else starts
        orch.step();
        orch.step();
        assert_eq!(launcher.launched(), vec![2]);
        assert_eq!(pending_ids(&orch), vec![3, 4]);

        launcher.finish(2);
        orch.step();
        assert_eq!(launcher.launched(), vec![2, 3]);

        launcher.finish(3);
        orch.step();
        assert_eq!(launcher.launched(), vec![2, 3, 4]);
        assert_eq!(orch.state(), OrchestratorState::Waiting);

        launcher.finish(4);
        orch.step();
        assert_eq!(orch.state(), OrchestratorState::Idle);
        assert_eq!(orch.active_jobs().count(), 0);
    }

    #[test]
    fn test_parallel_starts_everything() {
        let dir = TempDir::new().unwrap();
        let launcher = ScriptedLauncher::default();
        let (mut orch, _host) = orchestrator(config(&dir, true), launcher.clone());

        for id in [2, 3, 4] {
            orch.enqueue(job(id));
        }
        orch.step();

        assert_eq!(launcher.launched(), vec![2, 3, 4]);
        assert_eq!(orch.active_jobs().count(), 3);
        assert_eq!(orch.state(), OrchestratorState::Waiting);
    }

    #[test]
    fn test_launch_failure_keeps_job_at_head() {
        let dir = TempDir::new().unwrap();
        let launcher = ScriptedLauncher::default();
        let (mut orch, _host) = orchestrator(config(&dir, false), launcher.clone());

        orch.enqueue(job(2));
        orch.enqueue(job(3));
        launcher.refuse_next(1);

        orch.step();
        assert!(launcher.launched().is_empty());
        assert_eq!(pending_ids(&orch), vec![2, 3]);
        assert_eq!(orch.state(), OrchestratorState::Dispatching);

        orch.step();
        assert_eq!(launcher.launched(), vec![2]);
    }

    #[test]
    fn test_duplicate_job_ignored() {
        let dir = TempDir::new().unwrap();
        let (mut orch, _host) = orchestrator(config(&dir, false), ScriptedLauncher::default());

        orch.enqueue(job(2));
        orch.enqueue(job(2));
        assert_eq!(pending_ids(&orch), vec![2]);
    }

    #[test]
    fn test_discover_reads_save_directory() {
        let dir = TempDir::new().unwrap();
        let (mut orch, _host) = orchestrator(config(&dir, false), ScriptedLauncher::default());
        let saves = dir.path().join("saves");
        std::fs::write(saves.join("1.global.save"), b"").unwrap();
        std::fs::write(saves.join("2.app.save"), b"").unwrap();
        std::fs::write(saves.join("junk"), b"").unwrap();

        assert_eq!(orch.discover().unwrap(), 2);
        let mut ids = pending_ids(&orch);
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_disabled_skips_discovery_and_dispatch() {
        let dir = TempDir::new().unwrap();
        let launcher = ScriptedLauncher::default();
        let mut cfg = config(&dir, false);
        cfg.enabled = false;
        let (mut orch, _host) = orchestrator(cfg, launcher.clone());
        std::fs::write(dir.path().join("saves").join("2.app.save"), b"").unwrap();

        assert_eq!(orch.discover().unwrap(), 0);

        orch.enqueue(job(3));
        orch.step();
        assert!(launcher.launched().is_empty());
    }

    #[test]
    fn test_reload_toggles_parallel() {
        let dir = TempDir::new().unwrap();
        let launcher = ScriptedLauncher::default();
        let source = Arc::new(StaticConfigSource::new(config(&dir, false)));
        let host = MemoryHost::new(1);
        let mut orch = Orchestrator::new(
            Box::new(Arc::clone(&source)),
            launcher.clone(),
            ControlSignals::new(),
            Arc::new(host.clone()),
            Arc::new(host),
        )
        .unwrap();

        orch.enqueue(job(2));
        orch.enqueue(job(3));
        orch.step();
        assert_eq!(launcher.launched(), vec![2]);

        source.set(config(&dir, true));
        orch.reload().unwrap();
        assert!(orch.config().parallel);

        orch.step();
        assert_eq!(launcher.launched(), vec![2, 3]);
    }

    #[test]
    fn test_reload_error_keeps_config() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StaticConfigSource::new(config(&dir, false)));
        let host = MemoryHost::new(1);
        let mut orch = Orchestrator::new(
            Box::new(Arc::clone(&source)),
            ScriptedLauncher::default(),
            ControlSignals::new(),
            Arc::new(host.clone()),
            Arc::new(host),
        )
        .unwrap();

        let mut bad = config(&dir, true);
        bad.poll_interval_ms = 0;
        source.set(bad);

        assert!(orch.reload().is_err());
        assert!(!orch.config().parallel);
    }

    #[test]
    fn test_save_dir_must_be_a_directory() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, false);
        std::fs::write(&cfg.save_dir, b"file").unwrap();
        let host = MemoryHost::new(1);

        let result = Orchestrator::new(
            Box::new(StaticConfigSource::new(cfg)),
            ScriptedLauncher::default(),
            ControlSignals::new(),
            Arc::new(host.clone()),
            Arc::new(host),
        );
        assert!(matches!(result, Err(Error::NotADirectory { .. })));
    }

    #[test]
    fn test_shutdown_saves_and_abandons_queue() {
        let dir = TempDir::new().unwrap();
        let (mut orch, host) = orchestrator(config(&dir, false), ScriptedLauncher::default());
        host.load_pages(&[PageKey::new(5, 100, 0, 0)]);
        orch.enqueue(job(7));

        let outcome = orch.shutdown().unwrap();

        match outcome {
            RunOutcome::Saved(summary) => assert_eq!(summary.pages_saved, 1),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(orch.state(), OrchestratorState::Stopped);
        assert_eq!(orch.pending_jobs().count(), 0);
        assert!(dir.path().join("saves").join("2.postgres.save").exists());
    }

    #[test]
    fn test_shutdown_while_disabled_skips_save() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, false);
        cfg.enabled = false;
        let (mut orch, host) = orchestrator(cfg, ScriptedLauncher::default());
        host.load_pages(&[PageKey::new(5, 100, 0, 0)]);

        assert_eq!(orch.shutdown().unwrap(), RunOutcome::SaveSkipped);
        assert!(orch.save_dir().list_pending().unwrap().is_empty());
    }

    #[test]
    fn test_run_exits_on_host_death_without_saving() {
        let dir = TempDir::new().unwrap();
        let (mut orch, host) = orchestrator(config(&dir, false), ScriptedLauncher::default());
        host.load_pages(&[PageKey::new(5, 100, 0, 0)]);
        orch.signals().host_died();

        assert_eq!(orch.run().unwrap(), RunOutcome::HostDied);
        assert_eq!(orch.state(), OrchestratorState::Stopped);
        assert!(orch.save_dir().list_pending().unwrap().is_empty());
    }

    #[test]
    fn test_run_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let (mut orch, host) = orchestrator(config(&dir, false), ScriptedLauncher::default());
        host.load_pages(&[PageKey::new(5, 100, 0, 0)]);

        let signals = orch.signals().clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            signals.request_reload();
            std::thread::sleep(std::time::Duration::from_millis(50));
            signals.request_shutdown();
        });

        let outcome = orch.run().unwrap();
        stopper.join().unwrap();

        assert!(matches!(outcome, RunOutcome::Saved(_)));
        assert_eq!(orch.state(), OrchestratorState::Stopped);
    }

    #[test]
    fn test_shutdown_waits_for_running_workers() {
        let dir = TempDir::new().unwrap();
        let launcher = ScriptedLauncher::default();
        let (mut orch, host) = orchestrator(config(&dir, false), launcher.clone());
        host.load_pages(&[PageKey::new(5, 100, 0, 0)]);
        orch.enqueue(job(2));
        orch.step();
        assert_eq!(orch.active_jobs().count(), 1);

        let signals = orch.signals().clone();
        let worker = std::thread::spawn(move || {
            // Stand-in for a worker noticing the cancel flag at its next record
            while !signals.cancel_flag().is_cancelled() {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
            launcher.finish(2);
            signals.notify_worker_exit();
        });

        let outcome = orch.shutdown().unwrap();
        worker.join().unwrap();

        assert!(matches!(outcome, RunOutcome::Saved(_)));
        assert_eq!(orch.active_jobs().count(), 0);
        assert!(orch.signals().cancel_flag().is_cancelled());
        assert!(dir.path().join("saves").join("2.postgres.save").exists());
    }

    #[test]
    fn test_host_death_while_waiting_for_workers() {
        let dir = TempDir::new().unwrap();
        let launcher = ScriptedLauncher::default();
        let (mut orch, host) = orchestrator(config(&dir, false), launcher.clone());
        host.load_pages(&[PageKey::new(5, 100, 0, 0)]);
        orch.enqueue(job(2));
        orch.step();

        // Job 2 never exits
        let signals = orch.signals().clone();
        let killer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            signals.host_died();
        });

        assert_eq!(orch.shutdown().unwrap(), RunOutcome::HostDied);
        killer.join().unwrap();

        assert_eq!(orch.state(), OrchestratorState::Stopped);
        assert_eq!(launcher.launched(), vec![2]);
        assert!(orch.save_dir().list_pending().unwrap().is_empty());
    }
}
