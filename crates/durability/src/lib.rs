//! Durability layer for the hibernator
//!
//! This crate handles everything that touches disk:
//!
//! - Save-file record format: relation, fork, block and block-range records
//! - Save directory: naming, discovery and cleanup of save-files
//! - Snapshotter: scans the shared cache at shutdown and writes save-files
//! - Restorer: replays one save-file back into the cache
//! - Testing: an in-memory host for exercising both sides

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format; // Binary record stream and save-file names
pub mod paths; // Save directory layout
pub mod restorer; // Save-file replay
pub mod snapshotter; // Shutdown-time buffer saver
pub mod testing; // In-memory host

// === Re-exports ===
pub use format::{
    decode_records, encode_pages, parse_save_file_name, save_file_name, RecordEncoder,
    RecordReader, RecordWriter, SnapshotRecord, RECORD_SIZE,
};
pub use paths::SaveDirectory;
pub use restorer::{RestoreOutcome, RestoreStats, Restorer};
pub use snapshotter::{SaveSummary, SavedFile, Snapshotter};
