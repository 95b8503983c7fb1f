//! Narrow interfaces onto the host database
//!
//! The hibernator never touches the cache, the catalog or the storage manager
//! directly. Everything it needs from the host goes through these traits, so
//! the save/restore logic can run against a real engine or an in-memory model.

use crate::error::Result;
use crate::types::{BlockNumber, ForkNumber, Oid, PageKey};

/// Read access to the shared buffer cache for the shutdown scan.
///
/// Partition locks must be taken in ascending index order and released in
/// descending order; callers are responsible for that discipline.
pub trait BufferPool: Send + Sync {
    /// Number of mapping partitions guarding the cache
    fn partition_count(&self) -> usize;

    /// Take partition `index` in shared mode
    fn lock_partition_shared(&self, index: usize);

    /// Release partition `index`
    fn unlock_partition(&self, index: usize);

    /// Number of buffer slots in the cache
    fn buffer_count(&self) -> usize;

    /// Inspect one slot under its header lock.
    ///
    /// Returns the page identity if the slot holds a valid, tagged page.
    fn inspect_buffer(&self, slot: usize) -> Option<PageKey>;
}

/// Opens transactional sessions against a database.
pub trait SessionProvider: Send + Sync {
    /// Connect to `database` and start a transaction
    fn connect(&self, database: &str) -> Result<Box<dyn Session>>;
}

/// A connected session with an open transaction.
pub trait Session {
    /// Name of the database with id `database`, or `None` if it was dropped
    fn database_name(&self, database: Oid) -> Result<Option<String>>;

    /// Current relation id for a relfilenode, or `None` if the relation was
    /// rewritten or dropped since the filenode was recorded
    fn resolve_relation(&self, filenode: Oid) -> Result<Option<Oid>>;

    /// Open a relation for shared read access
    fn open_relation(&self, relation: Oid) -> Result<Box<dyn RelationReader>>;

    /// Commit the transaction and end the session
    fn finish(self: Box<Self>) -> Result<()>;
}

/// A relation opened for reading. Dropping it releases the lock.
pub trait RelationReader {
    /// Whether the fork exists on disk
    fn fork_exists(&self, fork: ForkNumber) -> bool;

    /// Current length of the fork in blocks
    fn nblocks(&self, fork: ForkNumber) -> Result<BlockNumber>;

    /// Read a block into the cache and release the pin straight away
    fn read_block(&mut self, fork: ForkNumber, block: BlockNumber) -> Result<()>;
}
