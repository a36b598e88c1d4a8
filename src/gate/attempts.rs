//! Failed-attempt log driving the per-IP lockout.
//!
//! One JSON array in `failed_attempts.json`. Every write prunes entries
//! older than the retention window and then caps the list, dropping the
//! oldest first. Reads never mutate the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::concurrency::{StateLock, write_private};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedAttempt {
    pub ip: String,
    /// Unix seconds.
    pub time: i64,
    #[serde(default)]
    pub user_agent: String,
}

/// Owns `failed_attempts.json`.
#[derive(Debug, Clone)]
pub struct AttemptLogRepository {
    path: PathBuf,
    lock: StateLock,
    retention_secs: i64,
    max_entries: usize,
}

impl AttemptLogRepository {
    pub fn new(
        path: impl Into<PathBuf>,
        lock: StateLock,
        retention_secs: i64,
        max_entries: usize,
    ) -> Self {
        Self {
            path: path.into(),
            lock,
            retention_secs,
            max_entries,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All logged attempts, oldest first. Unreadable content reads as empty.
    pub fn load(&self) -> Result<Vec<FailedAttempt>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.path.display()));
            }
        };

        match serde_json::from_str(&content) {
            Ok(attempts) => Ok(attempts),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Attempt log unreadable; starting fresh");
                Ok(Vec::new())
            }
        }
    }

    /// Failures from `ip` within the trailing `window_secs` before `now`.
    pub fn count_recent(&self, ip: &str, window_secs: i64, now: i64) -> Result<usize> {
        let cutoff = now - window_secs;
        Ok(self
            .load()?
            .iter()
            .filter(|a| a.ip == ip && a.time > cutoff)
            .count())
    }

    /// Record one failure, pruning and capping under the state lock.
    pub fn record(&self, ip: &str, user_agent: &str, now: i64) -> Result<()> {
        let _guard = self.lock.acquire()?;

        let mut attempts = self.load()?;
        attempts.push(FailedAttempt {
            ip: ip.to_string(),
            time: now,
            user_agent: user_agent.to_string(),
        });

        let cutoff = now - self.retention_secs;
        attempts.retain(|a| a.time > cutoff);
        if attempts.len() > self.max_entries {
            let excess = attempts.len() - self.max_entries;
            attempts.drain(..excess);
        }

        let json = serde_json::to_string_pretty(&attempts)?;
        write_private(&self.path, json.as_bytes())
            .with_context(|| format!("Failed to write {}", self.path.display()))?;

        tracing::debug!(ip, logged = attempts.len(), "Recorded failed access attempt");
        Ok(())
    }
}
