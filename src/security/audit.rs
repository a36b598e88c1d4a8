//! Append-only, hash-chained audit log of installer security events.
//!
//! Stored as `install-guard.audit.jsonl` in the state directory. One
//! JSON object per line; each entry carries the SHA-256 of the raw bytes
//! of the line before it, so any edit to history breaks the chain.
//!
//! | Field | Description |
//! |-------|-------------|
//! | `ts` | RFC 3339 timestamp |
//! | `action` | `token_issued`, `access_denied`, `secret_stored`, ... |
//! | `subject` | What the event concerns: client IP, secret name, command |
//! | `prev_entry_sha256` | SHA-256 of the previous line (64 zeros for the first) |
//! | `source` | `http`, `cli`, or `audit_system` |
//! | `detail` | Optional free text; never secret material |

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::concurrency::StateLock;

/// `prev_entry_sha256` of the first entry in a chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: String,
    pub action: AuditAction,
    #[serde(default)]
    pub subject: String,
    pub prev_entry_sha256: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// First access token issued.
    TokenIssued,
    /// Token replaced by an operator.
    TokenRegenerated,
    /// Token bound to the first client IP that presented it.
    IpBound,
    /// Missing, wrong, or IP-mismatched token.
    AccessDenied,
    /// Request refused because the client is locked out.
    LockedOut,
    /// Wizard session exceeded the inactivity timeout.
    SessionExpired,
    KeyGenerated,
    SecretStored,
    SecretDeleted,
    CommandExecuted,
    CommandRejected,
    /// Previous line was unparseable; a new chain segment starts here.
    ChainRecovery,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenIssued => "token_issued",
            Self::TokenRegenerated => "token_regenerated",
            Self::IpBound => "ip_bound",
            Self::AccessDenied => "access_denied",
            Self::LockedOut => "locked_out",
            Self::SessionExpired => "session_expired",
            Self::KeyGenerated => "key_generated",
            Self::SecretStored => "secret_stored",
            Self::SecretDeleted => "secret_deleted",
            Self::CommandExecuted => "command_executed",
            Self::CommandRejected => "command_rejected",
            Self::ChainRecovery => "chain_recovery",
        }
    }
}

/// Handle on one audit log file.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    lock_path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: lock_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry, chaining it to the current last line.
    ///
    /// A corrupted last line is answered with a `ChainRecovery` entry
    /// before the new one, recording where the break happened.
    pub fn append(
        &self,
        action: AuditAction,
        subject: &str,
        source: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        // Reading the tail and appending must be one step, or two
        // writers chain to the same predecessor.
        let _guard = StateLock::new(&self.lock_path)?.acquire()?;

        let prev_hash = match self.last_line()? {
            Some(last) if serde_json::from_str::<AuditEntry>(&last).is_ok() => {
                sha256_hex(last.as_bytes())
            }
            Some(last) => {
                let recovery = AuditEntry {
                    ts: chrono::Utc::now().to_rfc3339(),
                    action: AuditAction::ChainRecovery,
                    subject: String::new(),
                    prev_entry_sha256: sha256_hex(last.as_bytes()),
                    source: "audit_system".to_string(),
                    detail: Some(format!(
                        "Previous entry corrupted ({} bytes), new chain segment",
                        last.len()
                    )),
                };
                let json = serde_json::to_string(&recovery)
                    .context("Failed to serialize recovery entry")?;
                self.append_line(&json)?;
                tracing::warn!(path = %self.path.display(), "Audit log chain recovered");
                sha256_hex(json.as_bytes())
            }
            None => GENESIS_HASH.to_string(),
        };

        let entry = AuditEntry {
            ts: chrono::Utc::now().to_rfc3339(),
            action,
            subject: subject.to_string(),
            prev_entry_sha256: prev_hash,
            source: source.to_string(),
            detail: detail.map(str::to_string),
        };
        let json = serde_json::to_string(&entry).context("Failed to serialize audit entry")?;
        self.append_line(&json)
    }

    /// Append, logging instead of failing. Request paths use this so an
    /// unwritable audit log never turns into a denied installation step.
    pub fn record(&self, action: AuditAction, subject: &str, source: &str, detail: Option<&str>) {
        if let Err(e) = self.append(action, subject, source, detail) {
            tracing::error!(action = action.as_str(), error = %e, "Failed to write audit entry");
        }
    }

    /// All parseable entries; corrupted lines are skipped.
    pub fn read(&self) -> Result<Vec<AuditEntry>> {
        Ok(self
            .lines()?
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Line indices where the chain is broken. Empty means intact.
    pub fn verify(&self) -> Result<Vec<usize>> {
        let lines = self.lines()?;
        let mut broken = Vec::new();

        for (i, line) in lines.iter().enumerate() {
            let Ok(entry) = serde_json::from_str::<AuditEntry>(line) else {
                broken.push(i);
                continue;
            };
            let expected = match i {
                0 => GENESIS_HASH.to_string(),
                _ => sha256_hex(lines[i - 1].as_bytes()),
            };
            if entry.prev_entry_sha256 != expected {
                broken.push(i);
            }
        }

        Ok(broken)
    }

    fn lines(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).context("Failed to read audit log")?;
        Ok(content
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn last_line(&self) -> Result<Option<String>> {
        Ok(self.lines()?.pop())
    }

    fn append_line(&self, line: &str) -> Result<()> {
        let mut options = fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path).context("Failed to open audit log")?;
        writeln!(file, "{}", line).context("Failed to write audit entry")?;
        Ok(())
    }
}

fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
