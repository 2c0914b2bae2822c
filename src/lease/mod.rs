//! Job leases: one empty file per running job, held under an exclusive
//! advisory lock by the worker that owns the job.
//!
//! A lease whose file exists but which nobody holds belongs to a worker that
//! went away. Those are reported by [`LeaseStore::scan_expired`] and removed
//! by [`LeaseStore::reap_expired`].

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::Serialize;

use crate::error::{LabError, Result};
use crate::inventory::JobId;

/// A lease file found in the lease directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobLease {
    pub id: JobId,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Missing,
    Live,
    Expired,
}

/// Exclusive hold on a job's lease. Dropping the guard releases the lock and
/// leaves the file behind, which makes the lease expired.
#[derive(Debug)]
pub struct LeaseGuard {
    lease: JobLease,
    file: File,
}

impl LeaseGuard {
    pub fn lease(&self) -> &JobLease {
        &self.lease
    }

    pub fn job_id(&self) -> JobId {
        self.lease.id
    }

    /// Finish the job cleanly: delete the file, then drop the lock.
    ///
    /// The file goes first so no reaper ever sees it unlocked.
    pub fn release(self) -> Result<()> {
        remove_file(&self.lease.path)?;
        FileExt::unlock(&self.file).map_err(|e| LabError::filesystem(&self.lease.path, e))?;
        tracing::debug!(job_id = self.lease.id, "Lease released");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LeaseStore {
    dir: PathBuf,
}

impl LeaseStore {
    /// Open an existing lease directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let meta = fs::metadata(&dir).map_err(|e| LabError::filesystem(&dir, e))?;
        if !meta.is_dir() {
            let err = io::Error::new(io::ErrorKind::InvalidInput, "not a directory");
            return Err(LabError::filesystem(&dir, err));
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lease_path(&self, job_id: JobId) -> PathBuf {
        self.dir.join(job_id.to_string())
    }

    /// Create the empty lease file for `job_id` if it does not exist yet.
    pub fn create_lease(&self, job_id: JobId) -> Result<PathBuf> {
        let path = self.lease_path(job_id);
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| LabError::filesystem(&path, e))?;
        Ok(path)
    }

    /// Take the exclusive lock on `job_id`'s lease, creating the file if
    /// needed. `None` means another holder has it.
    ///
    /// A lock taken on a file that was unlinked after we opened it is
    /// dropped and the open is retried against whatever the path names now.
    pub fn acquire(&self, job_id: JobId) -> Result<Option<LeaseGuard>> {
        let path = self.lease_path(job_id);
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| LabError::filesystem(&path, e))?;

            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {}
                Err(e) if is_contended(&e) => {
                    tracing::debug!(job_id, "Lease held elsewhere");
                    return Ok(None);
                }
                Err(e) => return Err(LabError::filesystem(&path, e)),
            }

            if !is_current(&file, &path)? {
                tracing::debug!(job_id, "Lease file replaced while locking, retrying");
                continue;
            }
            tracing::debug!(job_id, "Lease acquired");
            return Ok(Some(LeaseGuard {
                lease: JobLease { id: job_id, path },
                file,
            }));
        }
    }

    /// True iff the file exists and nobody holds its lock.
    pub fn is_expired(&self, path: &Path) -> Result<bool> {
        Ok(probe(path)? == Probe::Expired)
    }

    /// Delete an unheld lease file. A file that is already gone is fine.
    ///
    /// The file is locked while it is unlinked, so a worker can never hold a
    /// lease whose file is being removed. Returns false and leaves the file
    /// alone when a live worker holds it.
    pub fn cleanup(&self, path: &Path) -> Result<bool> {
        cleanup(path)
    }

    /// Lazily walk the lease directory yielding expired leases.
    ///
    /// Each call starts a fresh walk. Files whose names are not job ids are
    /// skipped.
    pub fn scan_expired(&self) -> Result<impl Iterator<Item = Result<JobLease>> + '_> {
        self.scan(Probe::Expired)
    }

    /// Live leases whose job deadline is before `now`.
    ///
    /// Jobs `deadline_fn` knows nothing about are left alone.
    pub fn scan_timed_out<F>(&self, now: DateTime<Utc>, deadline_fn: F) -> Result<Vec<JobLease>>
    where
        F: Fn(JobId) -> Option<DateTime<Utc>>,
    {
        let mut timed_out = Vec::new();
        for lease in self.scan(Probe::Live)? {
            let lease = lease?;
            if matches!(deadline_fn(lease.id), Some(deadline) if deadline < now) {
                timed_out.push(lease);
            }
        }
        Ok(timed_out)
    }

    /// Live leases whose job has been flagged for abort.
    pub fn scan_abort_requested(&self, aborted: &HashSet<JobId>) -> Result<Vec<JobLease>> {
        let mut found = Vec::new();
        for lease in self.scan(Probe::Live)? {
            let lease = lease?;
            if aborted.contains(&lease.id) {
                found.push(lease);
            }
        }
        Ok(found)
    }

    /// Delete every expired lease and return the job ids that were reaped.
    pub fn reap_expired(&self) -> Result<Vec<JobId>> {
        let mut reaped = Vec::new();
        for lease in self.scan_expired()? {
            let lease = lease?;
            if !cleanup(&lease.path)? {
                tracing::debug!(job_id = lease.id, "Lease picked up again before reaping");
                continue;
            }
            tracing::info!(job_id = lease.id, "Reaped expired lease");
            reaped.push(lease.id);
        }
        Ok(reaped)
    }

    fn scan(&self, wanted: Probe) -> Result<impl Iterator<Item = Result<JobLease>> + '_> {
        let entries = fs::read_dir(&self.dir).map_err(|e| LabError::filesystem(&self.dir, e))?;
        Ok(entries.filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(LabError::filesystem(&self.dir, e))),
            };
            let id = parse_job_id(&entry.file_name())?;
            let path = entry.path();
            match probe(&path) {
                Ok(state) if state == wanted => Some(Ok(JobLease { id, path })),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        }))
    }
}

fn parse_job_id(name: &std::ffi::OsStr) -> Option<JobId> {
    name.to_str()?.parse().ok()
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

fn probe(path: &Path) -> Result<Probe> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Probe::Missing),
        Err(e) => return Err(LabError::filesystem(path, e)),
    };
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            FileExt::unlock(&file).map_err(|e| LabError::filesystem(path, e))?;
            Ok(Probe::Expired)
        }
        Err(e) if is_contended(&e) => Ok(Probe::Live),
        Err(e) => Err(LabError::filesystem(path, e)),
    }
}

/// True iff `file` is still the file `path` names and has not been unlinked.
#[cfg(unix)]
fn is_current(file: &File, path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata().map_err(|e| LabError::filesystem(path, e))?;
    if held.nlink() == 0 {
        return Ok(false);
    }
    match fs::metadata(path) {
        Ok(named) => Ok(named.dev() == held.dev() && named.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(LabError::filesystem(path, e)),
    }
}

#[cfg(not(unix))]
fn is_current(_file: &File, path: &Path) -> Result<bool> {
    Ok(path.exists())
}

/// Lock, unlink, unlock. False when a live holder has the lock.
fn cleanup(path: &Path) -> Result<bool> {
    loop {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(LabError::filesystem(path, e)),
        };
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if is_contended(&e) => return Ok(false),
            Err(e) => return Err(LabError::filesystem(path, e)),
        }
        if !is_current(&file, path)? {
            continue;
        }
        remove_file(path)?;
        FileExt::unlock(&file).map_err(|e| LabError::filesystem(path, e))?;
        return Ok(true);
    }
}

fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LabError::filesystem(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn only_decimal_names_are_leases() {
        assert_eq!(parse_job_id(OsStr::new("42")), Some(42));
        assert_eq!(parse_job_id(OsStr::new("42.tmp")), None);
        assert_eq!(parse_job_id(OsStr::new("-1")), None);
        assert_eq!(parse_job_id(OsStr::new(".hidden")), None);
    }

    #[test]
    fn unlinked_file_is_not_current() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("9");
        let file = File::create(&path).unwrap();
        assert!(is_current(&file, &path).unwrap());

        fs::remove_file(&path).unwrap();
        assert!(!is_current(&file, &path).unwrap());

        // A new file at the same path is a different lease.
        File::create(&path).unwrap();
        assert!(!is_current(&file, &path).unwrap());
    }

    #[test]
    fn open_rejects_missing_directory() {
        let err = LeaseStore::open("/nonexistent/lab-scheduler/leases").unwrap_err();
        assert!(err.is_fatal());
    }
}
