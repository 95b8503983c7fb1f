//! Restore worker launching
//!
//! The orchestrator only needs to start a worker for a job and later ask
//! whether it is still running. [`WorkerLauncher`] is that seam;
//! [`ThreadLauncher`] backs it with named OS threads.

use crate::signals::ControlSignals;
use hibernator_core::{Error, JobId, PendingJob, Result, SessionProvider};
use hibernator_durability::{RestoreOutcome, Restorer, SaveDirectory};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

/// Default number of restore workers that may run at once
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Everything a worker needs to run one restore job
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// The job to run
    pub job: PendingJob,
    /// Directory holding the job's save-file
    pub save_dir: SaveDirectory,
    /// Database used for the global job
    pub default_database: String,
}

/// Liveness of a launched worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Starting up or running
    Running,
    /// Exited, successfully or not
    Finished,
}

/// Starts restore workers and reports on them.
///
/// A worker runs its job once. Whatever way it ends, it is never restarted.
pub trait WorkerLauncher {
    /// Handle used to query a launched worker
    type Handle;

    /// Start a worker for `request`.
    ///
    /// An error means nothing was started; the caller may retry later.
    fn launch(&mut self, request: RestoreRequest) -> Result<Self::Handle>;

    /// Current status of a launched worker
    fn status(&self, handle: &Self::Handle) -> JobStatus;
}

/// Handle on a restore thread
#[derive(Debug)]
pub struct WorkerHandle {
    job_id: JobId,
    done: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    /// Job the worker is running
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wait for the worker thread to exit
    pub fn join(self) {
        if self.thread.join().is_err() {
            error!(job_id = %self.job_id, "Block Reader {} panicked", self.job_id);
        }
    }
}

/// Runs each restore job on its own named thread.
///
/// Workers share the signals' cancel flag and set the wake latch on exit.
pub struct ThreadLauncher {
    sessions: Arc<dyn SessionProvider>,
    signals: ControlSignals,
    max_workers: usize,
    running: Arc<AtomicUsize>,
}

impl ThreadLauncher {
    /// Create a launcher with [`DEFAULT_MAX_WORKERS`] worker slots
    pub fn new(sessions: Arc<dyn SessionProvider>, signals: ControlSignals) -> Self {
        ThreadLauncher {
            sessions,
            signals,
            max_workers: DEFAULT_MAX_WORKERS,
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Limit the number of workers running at once
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Number of workers currently running
    pub fn running_workers(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }
}

impl WorkerLauncher for ThreadLauncher {
    type Handle = WorkerHandle;

    fn launch(&mut self, request: RestoreRequest) -> Result<WorkerHandle> {
        let job_id = request.job.job_id;

        // Reserve a slot before spawning
        let reserved = self
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_workers).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(Error::host(format!(
                "could not register Block Reader {}: all {} worker slots in use",
                job_id, self.max_workers
            )));
        }

        let done = Arc::new(AtomicBool::new(false));
        let exit = WorkerExit {
            done: Arc::clone(&done),
            running: Arc::clone(&self.running),
            signals: self.signals.clone(),
        };
        let sessions = Arc::clone(&self.sessions);
        let cancel = self.signals.cancel_flag();

        let spawned = std::thread::Builder::new()
            .name(format!("hibernator-reader-{}", job_id))
            .spawn(move || {
                let _exit = exit;
                let restorer = Restorer::new(
                    &request.save_dir,
                    sessions.as_ref(),
                    &request.default_database,
                    cancel,
                );
                match restorer.restore(job_id) {
                    Ok(RestoreOutcome::Completed(_)) | Ok(RestoreOutcome::Interrupted(_)) => {}
                    Err(e) => {
                        error!(
                            job_id = %job_id,
                            path = ?e.path(),
                            error = %e,
                            "Block Reader {}: restore failed", job_id
                        );
                    }
                }
            });

        match spawned {
            Ok(thread) => {
                debug!(job_id = %job_id, "Started Block Reader {}", job_id);
                Ok(WorkerHandle {
                    job_id,
                    done,
                    thread,
                })
            }
            // The closure was dropped unrun, and with it the exit guard that
            // frees the slot.
            Err(e) => Err(Error::host(format!(
                "could not register Block Reader {}: {}",
                job_id, e
            ))),
        }
    }

    fn status(&self, handle: &WorkerHandle) -> JobStatus {
        if handle.done.load(Ordering::Acquire) {
            JobStatus::Finished
        } else {
            JobStatus::Running
        }
    }
}

/// Marks a worker finished when its thread exits, even by panic
struct WorkerExit {
    done: Arc<AtomicBool>,
    running: Arc<AtomicUsize>,
    signals: ControlSignals,
}

impl Drop for WorkerExit {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Release);
        self.running.fetch_sub(1, Ordering::AcqRel);
        self.signals.notify_worker_exit();
    }
}
