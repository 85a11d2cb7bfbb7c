//! Download relocation
//!
//! Transports hand a downloaded payload over at a transient location that
//! disappears as soon as the `download_finished` callback returns. The
//! [`Relocator`] copies it to a durable directory on a dedicated serial
//! queue and hands back a [`Relocation`] promise. The callback waits for the
//! copy to run, and the completion path waits on the same promise before
//! any response handler can observe the location.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::error::RelocationError;
use crate::executor::Executor;
use crate::pipeline::SerialQueue;

/// Result slot for one relocation
pub struct Relocation {
    source: PathBuf,
    slot: Mutex<Option<Result<PathBuf, RelocationError>>>,
    ready: Condvar,
}

impl Relocation {
    fn new(source: PathBuf) -> Self {
        Self { source, slot: Mutex::new(None), ready: Condvar::new() }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    fn fulfill(&self, result: Result<PathBuf, RelocationError>) {
        let mut slot = self.slot.lock();
        *slot = Some(result);
        self.ready.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Wait until the copy has run. Returns false on timeout.
    pub fn wait_ready(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let mut slot = self.slot.lock();
        while slot.is_none() {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                return slot.is_some();
            }
        }
        true
    }

    /// Wait for the outcome of the copy
    pub fn result(&self, limit: Duration) -> Result<PathBuf, RelocationError> {
        if !self.wait_ready(limit) {
            return Err(RelocationError::TimedOut(limit.as_millis() as u64));
        }
        match self.slot.lock().as_ref() {
            Some(result) => result.clone(),
            None => Err(RelocationError::TimedOut(limit.as_millis() as u64)),
        }
    }
}

impl std::fmt::Debug for Relocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relocation")
            .field("source", &self.source)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Copies transient downloads into `<download_dir>/<uuid>/<file name>`
pub struct Relocator {
    download_dir: PathBuf,
    wait_limit: Duration,
    queue: Arc<SerialQueue>,
}

impl Relocator {
    pub fn new(download_dir: impl Into<PathBuf>, wait_limit: Duration, executor: Executor) -> Self {
        Self {
            download_dir: download_dir.into(),
            wait_limit,
            queue: SerialQueue::released("relocation", executor),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn wait_limit(&self) -> Duration {
        self.wait_limit
    }

    /// Schedule a copy of `transient` and return its promise
    pub fn relocate(&self, transient: &Path) -> Arc<Relocation> {
        let relocation = Arc::new(Relocation::new(transient.to_path_buf()));
        let job_relocation = Arc::clone(&relocation);
        let download_dir = self.download_dir.clone();
        self.queue.enqueue(Box::new(move || {
            let result = copy_to_durable(job_relocation.source(), &download_dir);
            match &result {
                Ok(target) => tracing::debug!(
                    source = %job_relocation.source().display(),
                    target = %target.display(),
                    "Download relocated"
                ),
                Err(err) => tracing::warn!(error = %err, "Download relocation failed"),
            }
            job_relocation.fulfill(result);
        }));
        relocation
    }
}

fn copy_to_durable(source: &Path, download_dir: &Path) -> Result<PathBuf, RelocationError> {
    let file_name = source
        .file_name()
        .ok_or_else(|| RelocationError::MissingFileName(source.to_path_buf()))?;
    let target_dir = download_dir.join(Uuid::new_v4().simple().to_string());
    fs::create_dir_all(&target_dir).map_err(|e| io_error(&target_dir, e))?;

    let target = target_dir.join(file_name);
    if target.exists() {
        fs::remove_file(&target).map_err(|e| io_error(&target, e))?;
    }
    fs::copy(source, &target).map_err(|e| io_error(source, e))?;
    Ok(target)
}

fn io_error(path: &Path, err: std::io::Error) -> RelocationError {
    RelocationError::Io { path: path.to_path_buf(), message: err.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn relocator(dir: &Path) -> Relocator {
        Relocator::new(
            dir,
            Duration::from_secs(5),
            Executor::owned("webtask-relocation-test").unwrap(),
        )
    }

    #[test]
    fn test_relocates_file_contents() {
        let transient_dir = tempdir().unwrap();
        let durable_dir = tempdir().unwrap();
        let transient = transient_dir.path().join("file.zip");
        fs::write(&transient, b"PK\x03\x04payload").unwrap();

        let relocation = relocator(durable_dir.path()).relocate(&transient);
        assert!(relocation.wait_ready(Duration::from_secs(5)));
        let target = relocation.result(Duration::from_secs(1)).unwrap();

        assert!(target.starts_with(durable_dir.path()));
        assert_eq!(target.file_name().unwrap(), "file.zip");
        assert_eq!(fs::read(&target).unwrap(), b"PK\x03\x04payload");

        // The transient copy may now vanish without affecting the durable one
        fs::remove_file(&transient).unwrap();
        assert!(target.exists());
    }

    #[test]
    fn test_same_name_downloads_do_not_collide() {
        let transient_dir = tempdir().unwrap();
        let durable_dir = tempdir().unwrap();
        let transient = transient_dir.path().join("report.csv");
        let relocator = relocator(durable_dir.path());

        fs::write(&transient, b"first").unwrap();
        let first = relocator.relocate(&transient).result(Duration::from_secs(5)).unwrap();
        fs::write(&transient, b"second").unwrap();
        let second = relocator.relocate(&transient).result(Duration::from_secs(5)).unwrap();

        assert_ne!(first, second);
        assert_eq!(fs::read(&first).unwrap(), b"first");
        assert_eq!(fs::read(&second).unwrap(), b"second");
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let durable_dir = tempdir().unwrap();
        let missing = durable_dir.path().join("gone").join("file.bin");
        let err = relocator(durable_dir.path())
            .relocate(&missing)
            .result(Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, RelocationError::Io { .. }));
    }

    #[test]
    fn test_unfulfilled_relocation_times_out() {
        let relocation = Relocation::new(PathBuf::from("/tmp/never"));
        assert!(!relocation.wait_ready(Duration::from_millis(20)));
        assert_eq!(
            relocation.result(Duration::from_millis(20)).unwrap_err(),
            RelocationError::TimedOut(20)
        );
    }
}
