// ABOUTME: Single-instance guard backed by an advisory lock on a file in the data directory
// ABOUTME: Two bots on one account would answer every command twice

use anyhow::{Context, Result};
use fd_lock::{RwLock, RwLockWriteGuard};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct InstanceLock {
    path: PathBuf,
    lock: RwLock<File>,
}

impl InstanceLock {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            lock: RwLock::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock without blocking and record our PID in the file.
    /// The lock is held until the returned guard drops.
    pub fn try_acquire(&mut self) -> Result<RwLockWriteGuard<'_, File>> {
        let path = self.path.display().to_string();
        let mut guard = self
            .lock
            .try_write()
            .map_err(|_| anyhow::anyhow!("Another instance is already running (lock held on {path})"))?;
        guard.set_len(0).context("Failed to truncate lock file")?;
        writeln!(*guard, "{}", std::process::id()).context("Failed to write PID")?;
        tracing::debug!(path = %path, "Instance lock acquired");
        Ok(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_instance_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("chirp.lock");

        let mut first = InstanceLock::open(&path).unwrap();
        let guard = first.try_acquire().unwrap();

        let mut second = InstanceLock::open(&path).unwrap();
        let err = second.try_acquire().err().unwrap();
        assert!(err.to_string().contains("Another instance"));

        drop(guard);
        assert!(second.try_acquire().is_ok());
    }

    #[test]
    fn test_lock_file_records_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chirp.lock");

        let mut lock = InstanceLock::open(&path).unwrap();
        let _guard = lock.try_acquire().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }
}
