// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Non-blocking advisory lock.
//!
//! Pacman may fire hooks back to back, and nothing stops two package managers
//! from running at once. Only one pacsnap run may touch snapshots at a time.
//! The lock never waits: whoever finds it held simply skips its run.
//!
//! The lock is released when [`HookLock`] is dropped, or when the process
//! exits.

use fs2::FileExt;
use std::{
    fs::{create_dir_all, File, OpenOptions},
    path::{Path, PathBuf},
};
use tracing::debug;

/// Exclusive advisory lock held for the duration of a run.
#[derive(Debug)]
pub struct HookLock {
    file: File,
    path: PathBuf,
}

impl HookLock {
    /// Try to take lock at target path without blocking.
    ///
    /// Creates lock file, and its parent directory, if missing.
    ///
    /// # Errors
    ///
    /// - Return [`LockError::Busy`] if another process holds the lock.
    /// - Return [`LockError::Open`] if lock file cannot be opened.
    /// - Return [`LockError::Lock`] if locking fails for any other reason.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            create_dir_all(parent).map_err(|err| LockError::Open {
                source: err,
                lock_path: path.clone(),
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| LockError::Open {
                source: err,
                lock_path: path.clone(),
            })?;

        // INVARIANT: Call through trait, std's inherent File locks differ in error type.
        if let Err(err) = FileExt::try_lock_exclusive(&file) {
            if err.kind() == fs2::lock_contended_error().kind() {
                return Err(LockError::Busy { lock_path: path });
            }

            return Err(LockError::Lock {
                source: err,
                lock_path: path,
            });
        }

        debug!("acquired lock {:?}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HookLock {
    fn drop(&mut self) {
        // Process exit releases the lock anyway.
        let _ = FileExt::unlock(&self.file);
        debug!("released lock {:?}", self.path.display());
    }
}

/// Advisory lock error types.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Lock is held by another process.
    #[error("lock at {:?} is held by another process", lock_path.display())]
    Busy { lock_path: PathBuf },

    /// Lock file cannot be created or opened.
    #[error("failed to open lock file at {:?}", lock_path.display())]
    Open {
        #[source]
        source: std::io::Error,
        lock_path: PathBuf,
    },

    /// Lock file cannot be locked.
    #[error("failed to lock {:?}", lock_path.display())]
    Lock {
        #[source]
        source: std::io::Error,
        lock_path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = LockError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_busy() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pacsnap.lock");

        let held = HookLock::try_acquire(&path)?;
        let result = HookLock::try_acquire(&path);
        assert!(matches!(result, Err(LockError::Busy { .. })));

        drop(held);
        let again = HookLock::try_acquire(&path)?;
        assert_eq!(again.path(), path.as_path());

        Ok(())
    }

    #[test]
    fn creates_missing_parent_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run").join("pacsnap.lock");

        let _lock = HookLock::try_acquire(&path)?;
        assert!(path.exists());

        Ok(())
    }
}
