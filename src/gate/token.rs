//! The installer access token and its JSON record.

use anyhow::{Context, Result};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;

use crate::concurrency::{StateLock, write_private};

/// Random bytes behind each token.
pub const TOKEN_BYTES: usize = 32;

/// On-disk form of the current token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenRecord {
    pub token: String,
    /// Unix seconds.
    pub created_at: i64,
    /// First client IP to present the token; immutable once set.
    pub ip: Option<String>,
}

impl TokenRecord {
    fn fresh(now: i64) -> Self {
        Self {
            token: generate_token(),
            created_at: now,
            ip: None,
        }
    }

    /// Constant-time comparison against a presented token.
    pub fn matches(&self, provided: &str) -> bool {
        self.token.as_bytes().ct_eq(provided.as_bytes()).into()
    }
}

/// 32 random bytes as hex, in hyphen-separated groups of 8 characters.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);

    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    hex.as_bytes()
        .chunks(8)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}

/// Owns `install_token.json`.
#[derive(Debug, Clone)]
pub struct TokenRepository {
    path: PathBuf,
    lock: StateLock,
}

impl TokenRepository {
    pub fn new(path: impl Into<PathBuf>, lock: StateLock) -> Self {
        Self {
            path: path.into(),
            lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current record. A missing or unreadable file is `None`.
    pub fn load(&self) -> Result<Option<TokenRecord>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.path.display()));
            }
        };

        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Token record unreadable; treating as absent");
                Ok(None)
            }
        }
    }

    /// Issue a token unless one exists. Returns the record and whether it is new.
    pub fn issue_if_absent(&self, now: i64) -> Result<(TokenRecord, bool)> {
        let _guard = self.lock.acquire()?;
        if let Some(existing) = self.load()? {
            return Ok((existing, false));
        }
        let record = TokenRecord::fresh(now);
        self.save(&record)?;
        Ok((record, true))
    }

    /// Replace any existing token with a fresh, unbound one.
    pub fn replace(&self, now: i64) -> Result<TokenRecord> {
        let _guard = self.lock.acquire()?;
        self.remove()?;
        let record = TokenRecord::fresh(now);
        self.save(&record)?;
        Ok(record)
    }

    /// Bind the token to `ip` if it is still unbound.
    ///
    /// Returns the record as stored afterwards. When another request won
    /// the race the returned `ip` is theirs, and the caller must compare.
    pub fn bind_ip(&self, ip: &str) -> Result<Option<TokenRecord>> {
        let _guard = self.lock.acquire()?;
        let Some(mut record) = self.load()? else {
            return Ok(None);
        };
        if record.ip.is_none() {
            record.ip = Some(ip.to_string());
            self.save(&record)?;
        }
        Ok(Some(record))
    }

    fn save(&self, record: &TokenRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        write_private(&self.path, json.as_bytes())
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }

    fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(dir: &Path) -> TokenRepository {
        let lock = StateLock::new(dir.join("install-guard.lock")).unwrap();
        TokenRepository::new(dir.join("install_token.json"), lock)
    }

    #[test]
    fn token_format() {
        let token = generate_token();
        let groups: Vec<&str> = token.split('-').collect();
        assert_eq!(groups.len(), 8);
        assert!(groups.iter().all(|g| g.len() == 8));
        assert!(token.chars().all(|c| c == '-' || c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn issue_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = repo(tmp.path());

        let (first, issued) = repo.issue_if_absent(1_000).unwrap();
        assert!(issued);
        assert_eq!(first.ip, None);

        let (second, issued) = repo.issue_if_absent(2_000).unwrap();
        assert!(!issued);
        assert_eq!(first, second);
    }

    #[test]
    fn bind_is_first_writer_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = repo(tmp.path());
        repo.issue_if_absent(0).unwrap();

        let bound = repo.bind_ip("203.0.113.7").unwrap().unwrap();
        assert_eq!(bound.ip.as_deref(), Some("203.0.113.7"));

        let again = repo.bind_ip("198.51.100.2").unwrap().unwrap();
        assert_eq!(again.ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(repo.load().unwrap().unwrap().ip.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn bind_without_record_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(repo(tmp.path()).bind_ip("203.0.113.7").unwrap().is_none());
    }

    #[test]
    fn replace_yields_unbound_new_token() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = repo(tmp.path());
        let (old, _) = repo.issue_if_absent(0).unwrap();
        repo.bind_ip("203.0.113.7").unwrap();

        let new = repo.replace(10).unwrap();
        assert_ne!(old.token, new.token);
        assert_eq!(new.ip, None);
        assert_eq!(repo.load().unwrap().unwrap(), new);
    }

    #[test]
    fn corrupt_record_reads_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = repo(tmp.path());
        fs::write(repo.path(), "{not json").unwrap();
        assert!(repo.load().unwrap().is_none());
    }

    #[test]
    fn matching_is_exact() {
        let record = TokenRecord {
            token: "abcd1234-ef567890".to_string(),
            created_at: 0,
            ip: None,
        };
        assert!(record.matches("abcd1234-ef567890"));
        assert!(!record.matches("abcd1234-ef56789"));
        assert!(!record.matches("ABCD1234-EF567890"));
        assert!(!record.matches(""));
    }
}
