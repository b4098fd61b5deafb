//! Advisory file locks shared by every process using the same store.
//!
//! Locks are `flock`-style: they belong to an open file, so two handles on
//! the same lock file conflict even inside one process, and a lock is
//! released when its holder exits.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{trace, warn};

use certctl_common::Identity;

use super::error::StoreError;

/// An exclusive lock on one lock file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Wait until the lock is free.
    pub(crate) fn exclusive(path: &Path) -> Result<Self, StoreError> {
        let file = open_lock_file(path)?;
        FileExt::lock_exclusive(&file).map_err(|e| StoreError::io(path, e))?;
        trace!(path = %path.display(), "Acquired store lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Take the lock if nobody holds it.
    pub(crate) fn try_exclusive(path: &Path) -> Result<Option<Self>, StoreError> {
        let file = open_lock_file(path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release store lock");
        }
    }
}

/// Exclusive right to issue, renew or revoke one identity.
///
/// Held for the whole operation, across every process sharing the store.
#[derive(Debug)]
pub struct IdentityLease {
    identity: Identity,
    _lock: FileLock,
}

impl IdentityLease {
    pub(crate) fn new(identity: Identity, lock: FileLock) -> Self {
        Self {
            identity,
            _lock: lock,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

fn open_lock_file(path: &Path) -> Result<File, StoreError> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| StoreError::io(path, e))
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
