//! Control layer for the hibernator
//!
//! This crate drives the lower layers:
//! - Orchestrator: FIFO restore-job queue and the shutdown save
//! - Signals and wake latch: shutdown, reload and worker-exit notifications
//! - Configuration: `hibernator.toml` and reload rules
//! - Launcher: starting restore workers, backed by OS threads
//!
//! The orchestrator is the only component that knows about:
//! - Job scheduling and worker lifecycles
//! - When to save and when to restore

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod latch;
pub mod launcher;
pub mod orchestrator;
pub mod signals;

pub use config::{
    ConfigSource, FileConfigSource, HibernatorConfig, StaticConfigSource, CONFIG_FILE_NAME,
};
pub use latch::{WakeEvents, WakeLatch};
pub use launcher::{
    JobStatus, RestoreRequest, ThreadLauncher, WorkerHandle, WorkerLauncher, DEFAULT_MAX_WORKERS,
};
pub use orchestrator::{Orchestrator, OrchestratorState, RunOutcome};
pub use signals::ControlSignals;
