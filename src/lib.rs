//! Hibernator - keep the buffer cache warm across restarts
//!
//! At shutdown the hibernator records which pages sit in the shared buffer
//! cache, one compact save-file per database. At the next start it reads
//! those pages back in the background, so the first queries after a restart
//! don't pay for a cold cache.
//!
//! # Quick Start
//!
//! ```ignore
//! use hibernator::{ControlSignals, FileConfigSource, Orchestrator, ThreadLauncher};
//!
//! let signals = ControlSignals::new();
//! let launcher = ThreadLauncher::new(sessions.clone(), signals.clone());
//! let mut orchestrator = Orchestrator::new(
//!     Box::new(FileConfigSource::in_dir(data_dir)),
//!     launcher,
//!     signals.clone(),
//!     buffers,
//!     sessions,
//! )?;
//!
//! // On its own thread; the host calls signals.request_shutdown() to stop it
//! let outcome = orchestrator.run()?;
//! ```
//!
//! # Architecture
//!
//! - `hibernator-core`: identifiers, errors and the traits a host implements
//! - `hibernator-durability`: save-file format, saver and restorer
//! - `hibernator-engine`: orchestrator, signals, configuration and workers

pub use hibernator_core::*;
pub use hibernator_durability::{
    RestoreOutcome, RestoreStats, Restorer, SaveDirectory, SaveSummary, SavedFile, Snapshotter,
};
pub use hibernator_engine::*;

/// Save-file format and in-memory test host
pub mod durability {
    pub use hibernator_durability::*;
}
