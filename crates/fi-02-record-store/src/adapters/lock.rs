//! # Directory Lock
//!
//! Uses `fs2` for cross-platform file locking (flock on Unix, LockFile on
//! Windows). One writer per data directory.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::StorageError;

/// Exclusive lock on a data directory, released on drop.
///
/// ```ignore
/// let lock = DirectoryLock::acquire(Path::new("/data/main"))?;
/// // Lock is held until `lock` goes out of scope
/// ```
#[derive(Debug)]
pub struct DirectoryLock {
    file: File,
    path: PathBuf,
}

impl DirectoryLock {
    const LOCK_FILE: &'static str = "LOCK";

    /// Take the lock without waiting.
    pub fn acquire(dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::LOCK_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked {
                pid: read_pid(&path),
                path,
            });
        }

        // Only the holder rewrites the PID.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;

        debug!(path = %path.display(), "Acquired directory lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Could not release directory lock");
            return;
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_lock_fails() {
        let dir = TempDir::new().unwrap();
        let lock = DirectoryLock::acquire(dir.path()).unwrap();

        let err = DirectoryLock::acquire(dir.path()).unwrap_err();
        match err {
            StorageError::Locked { pid, .. } => assert_eq!(pid, Some(std::process::id())),
            other => panic!("unexpected error: {other}"),
        }
        drop(lock);

        assert!(DirectoryLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_drop_releases_and_removes_file() {
        let dir = TempDir::new().unwrap();
        let lock = DirectoryLock::acquire(dir.path()).unwrap();
        let path = lock.path().to_path_buf();
        assert!(path.exists());

        drop(lock);
        assert!(!path.exists());
        let again = DirectoryLock::acquire(dir.path()).unwrap();
        assert_eq!(read_pid(again.path()), Some(std::process::id()));
    }
}
