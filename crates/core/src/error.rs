//! Error types for the hibernator
//!
//! Every fatal condition of a save or restore run is an [`Error`]. Conditions
//! that only make the cache less warm (a dropped relation, a shrunk fork) are
//! not errors; callers count and log them instead.

use crate::types::JobId;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for hibernator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the hibernator
#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure on a save-file or the save directory
    #[error("I/O error on \"{path}\": {source}")]
    Io {
        /// File or directory the operation touched
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Save-file content is truncated or malformed
    #[error("corrupt save-file \"{path}\": {detail}")]
    Corruption {
        /// Save-file being read
        path: PathBuf,
        /// What was wrong
        detail: String,
    },

    /// A marker byte that starts no known record
    #[error("found unexpected save-file marker {marker:#04x} - {} in \"{path}\"", marker_char(.marker))]
    UnexpectedMarker {
        /// Save-file being read
        path: PathBuf,
        /// The raw marker byte
        marker: u8,
    },

    /// A record without its required predecessor
    #[error("found a {record} record without a preceding {expected} record in \"{path}\"")]
    OutOfOrder {
        /// Save-file being read
        path: PathBuf,
        /// Kind of the offending record
        record: &'static str,
        /// Kind of record that should have come first
        expected: &'static str,
    },

    /// No save-file in the directory carries the job's id
    #[error("Block Reader {job_id}: could not find its save-file")]
    SaveFileNotFound {
        /// Job whose file is missing
        job_id: JobId,
    },

    /// The save location exists but is not a directory
    #[error("\"{path}\" exists but is not a directory, hence disabling hibernation")]
    NotADirectory {
        /// The offending path
        path: PathBuf,
    },

    /// A host collaborator failed
    #[error("host error: {0}")]
    Host(String),

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),
}

fn marker_char(marker: &u8) -> char {
    char::from(*marker)
}

impl Error {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a corruption error for a save-file
    pub fn corruption(path: impl AsRef<Path>, detail: impl Into<String>) -> Self {
        Error::Corruption {
            path: path.as_ref().to_path_buf(),
            detail: detail.into(),
        }
    }

    /// Create a host collaborator error
    pub fn host(msg: impl Into<String>) -> Self {
        Error::Host(msg.into())
    }

    /// True if the error means the save-file content cannot be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corruption { .. } | Error::UnexpectedMarker { .. } | Error::OutOfOrder { .. }
        )
    }

    /// The file the error refers to, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            Error::Io { path, .. }
            | Error::Corruption { path, .. }
            | Error::UnexpectedMarker { path, .. }
            | Error::OutOfOrder { path, .. }
            | Error::NotADirectory { path } => Some(path),
            _ => None,
        }
    }
}
