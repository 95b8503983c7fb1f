//! Save-file replay
//!
//! A restore job reads one save-file and pulls every block it names back
//! into the cache. The file was written against the catalog as it was at
//! shutdown, so anything may have changed since: relations dropped or
//! rewritten, forks removed, relations truncated. Each of those is skipped
//! rather than treated as an error. Only an unreadable or malformed file
//! fails the job.
//!
//! ## Cancellation
//!
//! The cancel flag is checked before every record. A cancelled job stops
//! with its save-file still in place, so the next start retries it.

use crate::format::{RecordReader, SnapshotRecord};
use crate::paths::SaveDirectory;
use hibernator_core::{
    BlockNumber, CancelFlag, Error, ForkNumber, JobId, Oid, RelationReader, Result, Session,
    SessionProvider,
};
use std::fs::{File, Metadata};
use std::io::{self, BufReader};
use std::path::Path;
use tracing::{debug, info, trace};

/// Counters for one restore job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreStats {
    /// Relation records seen
    pub relations: u64,
    /// Relations skipped because they no longer exist under their filenode
    pub relations_skipped: u64,
    /// Forks skipped because the relation no longer has them
    pub forks_skipped: u64,
    /// Blocks read into the cache
    pub blocks_restored: u64,
    /// Blocks skipped as stale or beyond the end of their fork
    pub blocks_skipped: u64,
}

/// How a restore job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Every record was processed and the save-file removed
    Completed(RestoreStats),
    /// Stopped on request; the save-file was left in place
    Interrupted(RestoreStats),
}

impl RestoreOutcome {
    /// Counters gathered before the job ended
    pub fn stats(&self) -> &RestoreStats {
        match self {
            RestoreOutcome::Completed(stats) | RestoreOutcome::Interrupted(stats) => stats,
        }
    }

    /// Whether the whole file was replayed
    pub fn is_completed(&self) -> bool {
        matches!(self, RestoreOutcome::Completed(_))
    }
}

/// Replays save-files into the cache.
pub struct Restorer<'a> {
    save_dir: &'a SaveDirectory,
    sessions: &'a dyn SessionProvider,
    default_database: &'a str,
    cancel: CancelFlag,
}

impl<'a> Restorer<'a> {
    /// Create a restorer. The global save-file is replayed through a session
    /// on `default_database`.
    pub fn new(
        save_dir: &'a SaveDirectory,
        sessions: &'a dyn SessionProvider,
        default_database: &'a str,
        cancel: CancelFlag,
    ) -> Self {
        Restorer {
            save_dir,
            sessions,
            default_database,
            cancel,
        }
    }

    /// Replay the save-file of `job_id`.
    ///
    /// The file is found by scanning the save directory again, since only
    /// the job id is handed to a worker. On completion the session is
    /// committed and the file deleted.
    pub fn restore(&self, job_id: JobId) -> Result<RestoreOutcome> {
        let job = self.save_dir.find_job(job_id)?;
        let path = self.save_dir.save_file_path(&job);

        let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        let opened = file.metadata().map_err(|e| Error::io(&path, e))?;

        let database = if job.is_global() {
            self.default_database
        } else {
            job.database_name.as_str()
        };
        let session = self.sessions.connect(database)?;

        debug!(job_id = %job_id, database = %job.database_name, "Block Reader {}: started", job_id);

        let mut replay = Replay::new(job_id);
        let mut interrupted = false;

        // The handle stays open until the file is removed, so its inode
        // cannot be reused by a newer save-file in the meantime
        for record in RecordReader::new(BufReader::new(&file), &path) {
            if self.cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            replay.apply(session.as_ref(), record?)?;
        }

        let stats = replay.finish();
        session.finish()?;

        if interrupted {
            info!(
                job_id = %job_id,
                blocks = stats.blocks_restored,
                "Block Reader {}: interrupted, leaving save-file in place", job_id
            );
            return Ok(RestoreOutcome::Interrupted(stats));
        }

        remove_if_unchanged(&path, &opened)?;
        drop(file);

        info!(
            job_id = %job_id,
            skipped = stats.blocks_skipped,
            "Block Reader {}: restored {} blocks", job_id, stats.blocks_restored
        );
        info!(job_id = %job_id, "Block Reader {}: all blocks read successfully", job_id);
        Ok(RestoreOutcome::Completed(stats))
    }
}

/// Delete the replayed save-file, unless the path now names a different
/// file, such as one written by a shutdown save while this job was finishing.
fn remove_if_unchanged(path: &Path, opened: &Metadata) -> Result<()> {
    let current = match std::fs::metadata(path) {
        Ok(current) => current,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(path, e)),
    };

    if !same_file(opened, &current) {
        debug!(path = %path.display(), "Save-file was replaced, leaving the new one in place");
        return Ok(());
    }

    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

#[cfg(unix)]
fn same_file(a: &Metadata, b: &Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(a: &Metadata, b: &Metadata) -> bool {
    a.len() == b.len() && a.modified().ok() == b.modified().ok()
}

/// Replay state for one save-file.
///
/// A relation or fork that could not be found marks its group stale, and
/// every record below it in the hierarchy is skipped until the next record
/// at that level.
struct Replay {
    job_id: JobId,
    relation: Option<Box<dyn RelationReader>>,
    filenode: Oid,
    relation_stale: bool,
    fork: ForkNumber,
    fork_stale: bool,
    nblocks: BlockNumber,
    block: BlockNumber,
    block_skipped: bool,
    stats: RestoreStats,
}

impl Replay {
    fn new(job_id: JobId) -> Self {
        Replay {
            job_id,
            relation: None,
            filenode: 0,
            relation_stale: false,
            fork: 0,
            fork_stale: false,
            nblocks: 0,
            block: 0,
            block_skipped: false,
            stats: RestoreStats::default(),
        }
    }

    fn apply(&mut self, session: &dyn Session, record: SnapshotRecord) -> Result<()> {
        match record {
            SnapshotRecord::Relation(filenode) => self.start_relation(session, filenode),
            SnapshotRecord::Fork(fork) => self.start_fork(fork),
            SnapshotRecord::Block(block) => self.read_first(block),
            SnapshotRecord::Range(count) => self.read_range(count),
        }
    }

    fn start_relation(&mut self, session: &dyn Session, filenode: Oid) -> Result<()> {
        // The previous relation is closed before the next is looked up
        self.relation = None;
        self.filenode = filenode;
        self.fork_stale = false;
        self.block_skipped = false;
        self.stats.relations += 1;

        match session.resolve_relation(filenode)? {
            Some(oid) => {
                debug!(job_id = %self.job_id, filenode, relation = oid, "processing filenode");
                self.relation = Some(session.open_relation(oid)?);
                self.relation_stale = false;
            }
            None => {
                debug!(
                    job_id = %self.job_id,
                    filenode,
                    "skipping filenode; relation was dropped or rewritten since the save"
                );
                self.relation_stale = true;
                self.stats.relations_skipped += 1;
            }
        }
        Ok(())
    }

    fn start_fork(&mut self, fork: ForkNumber) -> Result<()> {
        self.fork = fork;
        self.block_skipped = false;

        let relation = match self.relation.as_ref() {
            Some(relation) => relation,
            None => {
                self.fork_stale = true;
                return Ok(());
            }
        };

        if relation.fork_exists(fork) {
            self.nblocks = relation.nblocks(fork)?;
            self.fork_stale = false;
            trace!(job_id = %self.job_id, filenode = self.filenode, fork, nblocks = self.nblocks, "processing fork");
        } else {
            debug!(job_id = %self.job_id, filenode = self.filenode, fork, "skipping fork; it no longer exists");
            self.fork_stale = true;
            self.stats.forks_skipped += 1;
        }
        Ok(())
    }

    fn read_first(&mut self, block: BlockNumber) -> Result<()> {
        self.block = block;

        if self.relation_stale || self.fork_stale {
            self.block_skipped = true;
            self.stats.blocks_skipped += 1;
            return Ok(());
        }

        if block >= self.nblocks {
            debug!(
                job_id = %self.job_id,
                filenode = self.filenode,
                fork = self.fork,
                block,
                nblocks = self.nblocks,
                "skipping block beyond the end of its fork"
            );
            self.block_skipped = true;
            self.stats.blocks_skipped += 1;
            return Ok(());
        }

        self.block_skipped = false;
        self.read(block)
    }

    fn read_range(&mut self, count: u32) -> Result<()> {
        if self.relation_stale || self.fork_stale || self.block_skipped {
            self.stats.blocks_skipped += u64::from(count);
            return Ok(());
        }

        let first = u64::from(self.block) + 1;
        let last = u64::from(self.block) + u64::from(count);

        for block in first..=last {
            if block >= u64::from(self.nblocks) {
                let remaining = last - block + 1;
                debug!(
                    job_id = %self.job_id,
                    filenode = self.filenode,
                    fork = self.fork,
                    block,
                    remaining,
                    "stopping block range at the end of its fork"
                );
                self.stats.blocks_skipped += remaining;
                break;
            }
            // block < nblocks, so it fits in a BlockNumber
            self.read(block as BlockNumber)?;
        }
        Ok(())
    }

    fn read(&mut self, block: BlockNumber) -> Result<()> {
        if let Some(relation) = self.relation.as_mut() {
            trace!(job_id = %self.job_id, filenode = self.filenode, fork = self.fork, block, "reading block");
            relation.read_block(self.fork, block)?;
            self.stats.blocks_restored += 1;
        }
        Ok(())
    }

    fn finish(mut self) -> RestoreStats {
        self.relation = None;
        self.stats
    }
}
