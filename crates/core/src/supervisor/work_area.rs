//! Per-job scratch directories.
//!
//! A [`WorkArea`] is created when a normalization attempt starts and removed
//! when the guard is dropped, whatever path the attempt took out of the
//! supervisor (success, failure, timeout, cancellation or panic).

use std::io;
use std::path::{Path, PathBuf};

use crate::types::DbId;

/// Exclusive scratch directory for one job attempt.
#[derive(Debug)]
pub struct WorkArea {
    path: PathBuf,
}

impl WorkArea {
    /// Directory name used for one attempt of a job under the work root.
    ///
    /// Keyed by attempt as well as job: a worker whose lease was reclaimed
    /// may still be tearing down its area while the next attempt runs.
    pub fn dir_name(job_id: DbId, attempt: i32) -> String {
        format!("job-{job_id}-{attempt}")
    }

    /// Create a fresh work area for `attempt` of `job_id` under `root`.
    ///
    /// A directory left behind by a crashed run of the same attempt is wiped
    /// first so it never sees stale partial output.
    pub fn acquire(root: &Path, job_id: DbId, attempt: i32) -> io::Result<Self> {
        let path = root.join(Self::dir_name(job_id, attempt));
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                tracing::debug!(job_id, path = %path.display(), "Removed stale work area");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkArea {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove work area",
                );
            }
        }
    }
}

/// Remove every entry under the work root.
///
/// Only safe while no supervisor is running, i.e. during startup recovery.
/// Returns the number of entries removed.
pub fn purge_work_root(root: &Path) -> io::Result<usize> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
        removed += 1;
    }
    Ok(removed)
}
