//! Save directory
//!
//! All save-files live in one flat directory:
//!
//! ```text
//! pg_hibernator/
//! ├── 1.global.save        # shared objects
//! ├── 2.postgres.save
//! ├── 3.orders.save
//! └── .4.app.save.tmp      # being written; ignored by discovery
//! ```

use crate::format::{
    is_temp_file_name, parse_save_file_name, save_file_name, temp_file_name,
};
use hibernator_core::{Error, JobId, PendingJob, Result};
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Handle on the directory holding save-files
#[derive(Debug, Clone)]
pub struct SaveDirectory {
    root: PathBuf,
}

impl SaveDirectory {
    /// Open the save directory, creating it if it does not exist.
    ///
    /// Fails if the path exists but is not a directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        match std::fs::metadata(&root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(Error::NotADirectory { path: root }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                create_private_dir(&root).map_err(|e| Error::io(&root, e))?;
                debug!(path = %root.display(), "Created save directory");
            }
            Err(e) => return Err(Error::io(&root, e)),
        }

        Ok(SaveDirectory { root })
    }

    /// Root of the save directory
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Final path of `job`'s save-file
    pub fn save_file_path(&self, job: &PendingJob) -> PathBuf {
        self.root.join(save_file_name(job))
    }

    /// Temporary path used while writing `job`'s save-file
    pub fn temp_file_path(&self, job: &PendingJob) -> PathBuf {
        self.root.join(temp_file_name(job))
    }

    /// List save-files as pending jobs, in directory order.
    ///
    /// Names that don't parse are ignored. If two files carry the same job
    /// id, only the first one listed is kept.
    pub fn list_pending(&self) -> Result<Vec<PendingJob>> {
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();

        for job in self.scan()? {
            if !seen.insert(job.job_id) {
                warn!(
                    job_id = %job.job_id,
                    database = %job.database_name,
                    "Ignoring save-file with duplicate job id"
                );
                continue;
            }
            jobs.push(job);
        }

        Ok(jobs)
    }

    /// Find the save-file of `job_id` by scanning the directory again.
    pub fn find_job(&self, job_id: JobId) -> Result<PendingJob> {
        self.scan()?
            .into_iter()
            .find(|job| job.job_id == job_id)
            .ok_or(Error::SaveFileNotFound { job_id })
    }

    /// Delete every save-file and leftover temporary file.
    ///
    /// Returns the number of files removed.
    pub fn remove_all(&self) -> Result<usize> {
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.root).map_err(|e| Error::io(&self.root, e))? {
            let entry = entry.map_err(|e| Error::io(&self.root, e))?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };

            if parse_save_file_name(name).is_some() || is_temp_file_name(name) {
                let path = entry.path();
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(path = %path.display(), "Removed stale save-file");
                        removed += 1;
                    }
                    // Already gone, e.g. a restore job finished meanwhile
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::io(&path, e)),
                }
            }
        }

        Ok(removed)
    }

    /// fsync the directory so renames and deletes are durable
    pub fn sync(&self) -> Result<()> {
        let dir = File::open(&self.root).map_err(|e| Error::io(&self.root, e))?;
        dir.sync_all().map_err(|e| Error::io(&self.root, e))
    }

    fn scan(&self) -> Result<Vec<PendingJob>> {
        let mut jobs = Vec::new();

        for entry in std::fs::read_dir(&self.root).map_err(|e| Error::io(&self.root, e))? {
            let entry = entry.map_err(|e| Error::io(&self.root, e))?;
            if let Some(job) = entry.file_name().to_str().and_then(parse_save_file_name) {
                jobs.push(job);
            }
        }

        Ok(jobs)
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}
