//! Identifier and job types
//!
//! The integer widths here are the widths written to save-files. Changing any
//! of them makes existing save-files unreadable; the file format carries no
//! version tag to detect it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Object identifier (databases, relations, relfilenodes).
pub type Oid = u32;

/// Fork of a relation (main data, free space map, visibility map, ...).
pub type ForkNumber = u32;

/// Block number within one fork of a relation.
pub type BlockNumber = u32;

/// The invalid object identifier. Pages of shared (global) objects carry it
/// as their database.
pub const INVALID_OID: Oid = 0;

/// Database-name component of the save-file holding shared objects.
pub const GLOBAL_DATABASE_NAME: &str = "global";

// ============================================================================
// PageKey
// ============================================================================

/// Identity of one page resident in the shared cache.
///
/// The derived ordering sorts by database, then filenode, then fork, then
/// block, which is the order save-files are written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    /// Owning database, or [`INVALID_OID`] for shared objects
    pub database: Oid,
    /// Storage object (relfilenode) the page belongs to
    pub filenode: Oid,
    /// Fork within the storage object
    pub fork: ForkNumber,
    /// Block within the fork
    pub block: BlockNumber,
}

impl PageKey {
    /// Create a page key
    pub fn new(database: Oid, filenode: Oid, fork: ForkNumber, block: BlockNumber) -> Self {
        PageKey {
            database,
            filenode,
            fork,
            block,
        }
    }

    /// True for pages of shared objects that belong to no database
    pub fn is_global(&self) -> bool {
        self.database == INVALID_OID
    }

    /// True if `next` is the block directly after this one in the same fork
    pub fn is_followed_by(&self, next: &PageKey) -> bool {
        self.database == next.database
            && self.filenode == next.filenode
            && self.fork == next.fork
            && self.block.checked_add(1) == Some(next.block)
    }
}

// ============================================================================
// JobId
// ============================================================================

/// Identifier of a restore job, the integer prefix of a save-file name.
///
/// `0` belongs to the orchestrator itself and `1` to the save-file of shared
/// objects; databases are numbered from `2` upward at save time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u32);

impl JobId {
    /// Reserved for the orchestrator's own registration
    pub const ORCHESTRATOR: JobId = JobId(0);

    /// Reserved for the save-file of shared (global) objects
    pub const GLOBAL: JobId = JobId(1);

    /// Wrap a raw job number
    pub const fn new(id: u32) -> Self {
        JobId(id)
    }

    /// Raw job number
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The id after this one
    pub fn next(self) -> Self {
        JobId(self.0 + 1)
    }

    /// True for the id of the shared-objects save-file
    pub fn is_global(self) -> bool {
        self == JobId::GLOBAL
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// PendingJob
// ============================================================================

/// A save-file discovered at startup and not yet restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJob {
    /// Job id parsed from the file name
    pub job_id: JobId,
    /// Database name parsed from the file name (`"global"` for job 1)
    pub database_name: String,
}

impl PendingJob {
    /// Create a pending job
    pub fn new(job_id: JobId, database_name: impl Into<String>) -> Self {
        PendingJob {
            job_id,
            database_name: database_name.into(),
        }
    }

    /// The pending job for the shared-objects save-file
    pub fn global() -> Self {
        PendingJob::new(JobId::GLOBAL, GLOBAL_DATABASE_NAME)
    }

    /// True if this job restores shared objects
    pub fn is_global(&self) -> bool {
        self.job_id.is_global()
    }
}

// ============================================================================
// CancelFlag
// ============================================================================

/// Cooperative cancellation flag.
///
/// Clones share the same flag. Restore workers poll it between records.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag
    pub fn new() -> Self {
        CancelFlag::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
