//! Advisory `flock` over a sidecar file (fs2).
//!
//! The gate's token record and failed-attempt log share one lock; the
//! audit log has its own so that appending an entry never nests inside
//! a held gate lock. flock is per open file, so nesting in one process
//! would deadlock.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StateLock {
    path: PathBuf,
}

/// Held lock; released when dropped.
pub struct StateLockGuard {
    file: File,
}

impl Drop for StateLockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl StateLock {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is ours.
    pub fn acquire(&self) -> Result<StateLockGuard> {
        let file = File::create(&self.path)
            .with_context(|| format!("Failed to open lock file {}", self.path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", self.path.display()))?;
        Ok(StateLockGuard { file })
    }
}
