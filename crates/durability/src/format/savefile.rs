//! Save-file naming.
//!
//! Save-files are named `<job_id>.<database_name>.save`. The shared-objects
//! file uses job id 1 and the literal database name `global`. Files are
//! written under a hidden temporary name first and renamed into place, so a
//! half-written file never parses as a save-file.

use hibernator_core::{JobId, PendingJob};

/// Extension of every save-file
pub const SAVE_FILE_EXTENSION: &str = "save";

/// Suffix appended to the temporary name of a save-file being written
pub const TEMP_FILE_SUFFIX: &str = ".tmp";

/// File name of the save-file for `job`
pub fn save_file_name(job: &PendingJob) -> String {
    format!(
        "{}.{}.{}",
        job.job_id, job.database_name, SAVE_FILE_EXTENSION
    )
}

/// Temporary file name used while `job`'s save-file is being written
pub fn temp_file_name(job: &PendingJob) -> String {
    format!(".{}{}", save_file_name(job), TEMP_FILE_SUFFIX)
}

/// True for names produced by [`temp_file_name`]
pub fn is_temp_file_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_FILE_SUFFIX)
}

/// Parse a save-file name into the job it describes.
///
/// Returns `None` unless the name is exactly `<integer>.<text>.save` with a
/// non-empty database name. Job id 0 belongs to the orchestrator and is never
/// a restore job.
pub fn parse_save_file_name(name: &str) -> Option<PendingJob> {
    let stem = name.strip_suffix(SAVE_FILE_EXTENSION)?.strip_suffix('.')?;
    let (id, database_name) = stem.split_once('.')?;

    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if database_name.is_empty() {
        return None;
    }

    let job_id = JobId::new(id.parse::<u32>().ok()?);
    if job_id == JobId::ORCHESTRATOR {
        return None;
    }

    Some(PendingJob::new(job_id, database_name))
}
