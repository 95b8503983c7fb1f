//! Shutdown-time buffer saver
//!
//! Scans the shared cache, sorts what it finds and writes one save-file per
//! database. Each file is written crash-safely:
//! 1. Write records to a hidden temporary file
//! 2. fsync the temporary file
//! 3. Rename it to its final name
//!
//! and the directory is fsynced once all files are in place. Save-files left
//! over from an earlier run are removed first, so job ids in the directory
//! are always unique.

use crate::format::{RecordEncoder, RecordWriter};
use crate::paths::SaveDirectory;
use hibernator_core::{
    BufferPool, Error, JobId, PageKey, PendingJob, Result, SessionProvider, INVALID_OID,
};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{debug, info, trace, warn};

/// One save-file written by the saver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    /// Job the file will be restored as
    pub job: PendingJob,
    /// Final path of the file
    pub path: PathBuf,
    /// Number of pages the file describes
    pub pages: usize,
    /// Number of records written
    pub records: u64,
}

/// Result of a save run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveSummary {
    /// Files written, in job id order
    pub files: Vec<SavedFile>,
    /// Pages recorded across all files
    pub pages_saved: usize,
    /// Pages left out because their database no longer exists
    pub pages_dropped: usize,
}

/// Writes the shared cache's resident pages to save-files.
pub struct Snapshotter<'a> {
    buffers: &'a dyn BufferPool,
    sessions: &'a dyn SessionProvider,
    save_dir: &'a SaveDirectory,
    default_database: &'a str,
}

impl<'a> Snapshotter<'a> {
    /// Create a saver. Database names are looked up through a session on
    /// `default_database`.
    pub fn new(
        buffers: &'a dyn BufferPool,
        sessions: &'a dyn SessionProvider,
        save_dir: &'a SaveDirectory,
        default_database: &'a str,
    ) -> Self {
        Snapshotter {
            buffers,
            sessions,
            save_dir,
            default_database,
        }
    }

    /// Scan the cache and write save-files for everything resident
    pub fn scan_and_persist(&self) -> Result<SaveSummary> {
        let pages = self.scan();
        debug!(pages = pages.len(), "Scanned shared buffers");
        self.persist(pages)
    }

    /// Collect the identity of every valid, tagged page in the cache.
    ///
    /// All mapping partitions are held in shared mode for the duration of the
    /// scan, and each slot is inspected under its own header lock.
    pub fn scan(&self) -> Vec<PageKey> {
        let mut pages = Vec::with_capacity(self.buffers.buffer_count());

        let _locks = PartitionLocks::acquire(self.buffers);
        for slot in 0..self.buffers.buffer_count() {
            if let Some(page) = self.buffers.inspect_buffer(slot) {
                pages.push(page);
            }
        }

        pages
    }

    /// Sort `pages` and write one save-file per database.
    ///
    /// Shared-object pages go to job 1; each database after that takes the
    /// next job id in sort order. Pages of databases that no longer exist are
    /// dropped.
    pub fn persist(&self, mut pages: Vec<PageKey>) -> Result<SaveSummary> {
        pages.sort_unstable();

        let session = self.sessions.connect(self.default_database)?;

        let removed = self.save_dir.remove_all()?;
        if removed > 0 {
            debug!(removed, "Removed save-files from an earlier run");
        }

        let mut summary = SaveSummary::default();
        let mut last_job = JobId::GLOBAL;

        for group in database_groups(&pages) {
            let database = group[0].database;

            let job = if database == INVALID_OID {
                PendingJob::global()
            } else {
                match session.database_name(database)? {
                    Some(name) if !name.is_empty() && !name.chars().any(std::path::is_separator) => {
                        last_job = last_job.next();
                        PendingJob::new(last_job, name)
                    }
                    Some(name) => {
                        warn!(database, name = %name, "Skipping database whose name cannot be a file name");
                        summary.pages_dropped += group.len();
                        continue;
                    }
                    None => {
                        debug!(
                            database,
                            pages = group.len(),
                            "Skipping pages of a database that no longer exists"
                        );
                        summary.pages_dropped += group.len();
                        continue;
                    }
                }
            };

            let saved = self.write_save_file(&job, group)?;
            summary.pages_saved += saved.pages;
            summary.files.push(saved);
        }

        self.save_dir.sync()?;
        session.finish()?;

        info!(
            files = summary.files.len(),
            "Buffer Saver: saved metadata of {} blocks", summary.pages_saved
        );
        Ok(summary)
    }

    fn write_save_file(&self, job: &PendingJob, pages: &[PageKey]) -> Result<SavedFile> {
        debug_assert!(!pages.is_empty());

        let final_path = self.save_dir.save_file_path(job);
        let temp_path = self.save_dir.temp_file_path(job);

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp_path)
            .map_err(|e| Error::io(&temp_path, e))?;

        let mut writer = RecordWriter::new(BufWriter::new(file));
        for record in RecordEncoder::new(pages) {
            trace!(job_id = %job.job_id, ?record, "writer: writing record");
            writer
                .write(&record)
                .map_err(|e| Error::io(&temp_path, e))?;
        }
        let records = writer.records_written();

        let mut buffered = writer.into_inner();
        buffered.flush().map_err(|e| Error::io(&temp_path, e))?;
        let file = buffered
            .into_inner()
            .map_err(|e| Error::io(&temp_path, e.into_error()))?;
        file.sync_all().map_err(|e| Error::io(&temp_path, e))?;
        drop(file);

        std::fs::rename(&temp_path, &final_path).map_err(|e| Error::io(&final_path, e))?;

        debug!(
            job_id = %job.job_id,
            database = %job.database_name,
            pages = pages.len(),
            records,
            "Wrote save-file"
        );

        Ok(SavedFile {
            job: job.clone(),
            path: final_path,
            pages: pages.len(),
            records,
        })
    }
}

/// Holds every mapping partition in shared mode.
///
/// Partitions are taken in ascending order and released in descending order
/// on drop, so a concurrent acquirer following the same order cannot deadlock
/// against the scan.
struct PartitionLocks<'a> {
    buffers: &'a dyn BufferPool,
    held: usize,
}

impl<'a> PartitionLocks<'a> {
    fn acquire(buffers: &'a dyn BufferPool) -> Self {
        let mut locks = PartitionLocks { buffers, held: 0 };
        for index in 0..buffers.partition_count() {
            buffers.lock_partition_shared(index);
            locks.held += 1;
        }
        locks
    }
}

impl Drop for PartitionLocks<'_> {
    fn drop(&mut self) {
        for index in (0..self.held).rev() {
            self.buffers.unlock_partition(index);
        }
    }
}

/// Split sorted pages into runs of the same database
fn database_groups(pages: &[PageKey]) -> Vec<&[PageKey]> {
    let mut groups = Vec::new();
    let mut start = 0;

    for end in 1..=pages.len() {
        if end == pages.len() || pages[end].database != pages[start].database {
            groups.push(&pages[start..end]);
            start = end;
        }
    }

    groups
}
