//! In-memory host
//!
//! Relations are registered per database name, the way relfilenodes are only
//! meaningful inside the database whose catalog maps them.

use hibernator_core::{
    BlockNumber, BufferPool, Error, ForkNumber, Oid, PageKey, RelationReader, Result, Session,
    SessionProvider,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A partition lock operation observed by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    /// Partition taken in shared mode
    Acquire(usize),
    /// Partition released
    Release(usize),
}

/// One block read into the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRead {
    /// Database the reading session was connected to
    pub database: String,
    /// Relation the block belongs to
    pub relation: Oid,
    /// Fork of the block
    pub fork: ForkNumber,
    /// Block number
    pub block: BlockNumber,
}

#[derive(Debug, Clone)]
struct MemoryRelation {
    oid: Oid,
    forks: HashMap<ForkNumber, BlockNumber>,
}

#[derive(Default)]
struct HostState {
    partitions: usize,
    buffers: Mutex<Vec<Option<PageKey>>>,
    databases: Mutex<HashMap<Oid, String>>,
    relations: Mutex<HashMap<(String, Oid), MemoryRelation>>,
    lock_events: Mutex<Vec<LockEvent>>,
    reads: Mutex<Vec<BlockRead>>,
    connections: Mutex<Vec<String>>,
    finished_sessions: AtomicUsize,
    open_relations: AtomicUsize,
}

/// In-memory stand-in for the host database.
///
/// Clones share state, so one clone can be handed to the code under test
/// while another inspects what happened.
#[derive(Clone)]
pub struct MemoryHost {
    state: Arc<HostState>,
}

impl MemoryHost {
    /// Create a host whose buffer pool has `partitions` mapping partitions
    pub fn new(partitions: usize) -> Self {
        MemoryHost {
            state: Arc::new(HostState {
                partitions,
                ..Default::default()
            }),
        }
    }

    // ========================================================================
    // Setup
    // ========================================================================

    /// Register a database
    pub fn add_database(&self, oid: Oid, name: &str) {
        self.state.databases.lock().insert(oid, name.to_string());
    }

    /// Drop a database from the catalog
    pub fn drop_database(&self, oid: Oid) {
        self.state.databases.lock().remove(&oid);
    }

    /// Register a relation of `database` with the given fork lengths
    pub fn add_relation(
        &self,
        database: &str,
        filenode: Oid,
        relation: Oid,
        forks: &[(ForkNumber, BlockNumber)],
    ) {
        self.state.relations.lock().insert(
            (database.to_string(), filenode),
            MemoryRelation {
                oid: relation,
                forks: forks.iter().copied().collect(),
            },
        );
    }

    /// Forget a relation, as if it was dropped or rewritten
    pub fn drop_relation(&self, database: &str, filenode: Oid) {
        self.state
            .relations
            .lock()
            .remove(&(database.to_string(), filenode));
    }

    /// Change the length of a fork, as if it was truncated or extended
    pub fn set_fork_len(&self, database: &str, filenode: Oid, fork: ForkNumber, nblocks: BlockNumber) {
        if let Some(rel) = self
            .state
            .relations
            .lock()
            .get_mut(&(database.to_string(), filenode))
        {
            rel.forks.insert(fork, nblocks);
        }
    }

    /// Remove a fork from a relation
    pub fn remove_fork(&self, database: &str, filenode: Oid, fork: ForkNumber) {
        if let Some(rel) = self
            .state
            .relations
            .lock()
            .get_mut(&(database.to_string(), filenode))
        {
            rel.forks.remove(&fork);
        }
    }

    /// Fill the buffer pool with `pages`, one per slot
    pub fn load_pages(&self, pages: &[PageKey]) {
        self.state
            .buffers
            .lock()
            .extend(pages.iter().copied().map(Some));
    }

    /// Add `count` slots holding no valid page
    pub fn add_empty_slots(&self, count: usize) {
        self.state
            .buffers
            .lock()
            .extend(std::iter::repeat(None).take(count));
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Partition lock operations, in the order they happened
    pub fn lock_events(&self) -> Vec<LockEvent> {
        self.state.lock_events.lock().clone()
    }

    /// Blocks read into the cache, in the order they were read
    pub fn reads(&self) -> Vec<BlockRead> {
        self.state.reads.lock().clone()
    }

    /// Databases connected to, in order
    pub fn connections(&self) -> Vec<String> {
        self.state.connections.lock().clone()
    }

    /// Number of sessions that committed
    pub fn finished_sessions(&self) -> usize {
        self.state.finished_sessions.load(Ordering::SeqCst)
    }

    /// Number of relations currently open
    pub fn open_relations(&self) -> usize {
        self.state.open_relations.load(Ordering::SeqCst)
    }
}

impl BufferPool for MemoryHost {
    fn partition_count(&self) -> usize {
        self.state.partitions
    }

    fn lock_partition_shared(&self, index: usize) {
        self.state.lock_events.lock().push(LockEvent::Acquire(index));
    }

    fn unlock_partition(&self, index: usize) {
        self.state.lock_events.lock().push(LockEvent::Release(index));
    }

    fn buffer_count(&self) -> usize {
        self.state.buffers.lock().len()
    }

    fn inspect_buffer(&self, slot: usize) -> Option<PageKey> {
        self.state.buffers.lock().get(slot).copied().flatten()
    }
}

impl SessionProvider for MemoryHost {
    fn connect(&self, database: &str) -> Result<Box<dyn Session>> {
        let known = self
            .state
            .databases
            .lock()
            .values()
            .any(|name| name == database);
        if !known {
            return Err(Error::host(format!(
                "database \"{}\" does not exist",
                database
            )));
        }

        self.state.connections.lock().push(database.to_string());
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            database: database.to_string(),
        }))
    }
}

struct MemorySession {
    state: Arc<HostState>,
    database: String,
}

impl Session for MemorySession {
    fn database_name(&self, database: Oid) -> Result<Option<String>> {
        Ok(self.state.databases.lock().get(&database).cloned())
    }

    fn resolve_relation(&self, filenode: Oid) -> Result<Option<Oid>> {
        Ok(self
            .state
            .relations
            .lock()
            .get(&(self.database.clone(), filenode))
            .map(|rel| rel.oid))
    }

    fn open_relation(&self, relation: Oid) -> Result<Box<dyn RelationReader>> {
        let forks = self
            .state
            .relations
            .lock()
            .iter()
            .find(|((db, _), rel)| *db == self.database && rel.oid == relation)
            .map(|(_, rel)| rel.forks.clone())
            .ok_or_else(|| Error::host(format!("could not open relation {}", relation)))?;

        self.state.open_relations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryRelationReader {
            state: Arc::clone(&self.state),
            database: self.database.clone(),
            relation,
            forks,
        }))
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.state.finished_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryRelationReader {
    state: Arc<HostState>,
    database: String,
    relation: Oid,
    forks: HashMap<ForkNumber, BlockNumber>,
}

impl RelationReader for MemoryRelationReader {
    fn fork_exists(&self, fork: ForkNumber) -> bool {
        self.forks.contains_key(&fork)
    }

    fn nblocks(&self, fork: ForkNumber) -> Result<BlockNumber> {
        self.forks
            .get(&fork)
            .copied()
            .ok_or_else(|| Error::host(format!("fork {} does not exist", fork)))
    }

    fn read_block(&mut self, fork: ForkNumber, block: BlockNumber) -> Result<()> {
        let nblocks = self.nblocks(fork)?;
        if block >= nblocks {
            return Err(Error::host(format!(
                "could not read block {} in fork {} of relation {}: only {} blocks",
                block, fork, self.relation, nblocks
            )));
        }

        self.state.reads.lock().push(BlockRead {
            database: self.database.clone(),
            relation: self.relation,
            fork,
            block,
        });
        Ok(())
    }
}

impl Drop for MemoryRelationReader {
    fn drop(&mut self) {
        self.state.open_relations.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_slots() {
        let host = MemoryHost::new(2);
        host.load_pages(&[PageKey::new(1, 2, 0, 3)]);
        host.add_empty_slots(2);

        assert_eq!(host.buffer_count(), 3);
        assert_eq!(host.inspect_buffer(0), Some(PageKey::new(1, 2, 0, 3)));
        assert_eq!(host.inspect_buffer(1), None);
        assert_eq!(host.inspect_buffer(9), None);
    }

    #[test]
    fn test_connect_unknown_database_fails() {
        let host = MemoryHost::new(1);
        assert!(host.connect("nope").is_err());
        assert!(host.connections().is_empty());
    }

    #[test]
    fn test_relations_are_per_database() {
        let host = MemoryHost::new(1);
        host.add_database(1, "a");
        host.add_database(2, "b");
        host.add_relation("a", 100, 500, &[(0, 4)]);

        let a = host.connect("a").unwrap();
        let b = host.connect("b").unwrap();
        assert_eq!(a.resolve_relation(100).unwrap(), Some(500));
        assert_eq!(b.resolve_relation(100).unwrap(), None);
    }

    #[test]
    fn test_relation_reader_tracks_reads_and_close() {
        let host = MemoryHost::new(1);
        host.add_database(1, "a");
        host.add_relation("a", 100, 500, &[(0, 4)]);

        let session = host.connect("a").unwrap();
        {
            let mut rel = session.open_relation(500).unwrap();
            assert_eq!(host.open_relations(), 1);
            assert!(rel.fork_exists(0));
            assert!(!rel.fork_exists(1));
            rel.read_block(0, 3).unwrap();
            assert!(rel.read_block(0, 4).is_err());
        }
        assert_eq!(host.open_relations(), 0);
        assert_eq!(host.reads().len(), 1);

        session.finish().unwrap();
        assert_eq!(host.finished_sessions(), 1);
    }
}
