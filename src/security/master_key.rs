//! Master key provisioning.
//!
//! The application master key lives in the application's `.env` file as
//! `APP_KEY=base64:<44 chars>`. The provisioner is the only writer of
//! that entry. Once a valid key exists it refuses to replace it unless
//! forced, since every secret sealed under the old key would become
//! unreadable.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::cipher::{AuthenticatedCipher, MasterKey};
use crate::actions::ErrorKind;
use crate::concurrency::write_private;

/// Env entry holding the master key.
pub const APP_KEY: &str = "APP_KEY";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("no valid {APP_KEY} is configured; generate the master key first")]
    PrerequisiteMissing,

    #[error("failed to persist {APP_KEY} to {path}: {source}")]
    PersistenceError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("a valid {APP_KEY} already exists; refusing to replace it without force")]
    KeyAlreadyExists,
}

impl KeyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PrerequisiteMissing => ErrorKind::PrerequisiteMissing,
            Self::PersistenceError { .. } => ErrorKind::PersistenceError,
            Self::KeyAlreadyExists => ErrorKind::KeyAlreadyExists,
        }
    }
}

/// Generates and stores the master key in a dotenv-style file.
#[derive(Debug, Clone)]
pub struct MasterKeyProvisioner {
    env_file: PathBuf,
}

impl MasterKeyProvisioner {
    pub fn new(env_file: impl Into<PathBuf>) -> Self {
        Self {
            env_file: env_file.into(),
        }
    }

    pub fn env_file(&self) -> &Path {
        &self.env_file
    }

    /// True only for a present, prefixed value decoding to exactly 32 bytes.
    pub fn key_exists(&self) -> bool {
        self.current_key().is_ok()
    }

    /// Load the current key, or `PrerequisiteMissing` for anything unusable.
    pub fn current_key(&self) -> Result<MasterKey, KeyError> {
        let value = read_env_value(&self.env_file, APP_KEY).ok_or(KeyError::PrerequisiteMissing)?;
        MasterKey::parse(&value).map_err(|_| KeyError::PrerequisiteMissing)
    }

    /// A cipher bound to the current key.
    pub fn cipher(&self) -> Result<AuthenticatedCipher, KeyError> {
        Ok(AuthenticatedCipher::new(&self.current_key()?))
    }

    /// Generate and persist a fresh key, returning its encoded form.
    pub fn generate(&self, force: bool) -> Result<String, KeyError> {
        if self.key_exists() && !force {
            tracing::warn!(env_file = %self.env_file.display(), "Refusing to replace existing master key");
            return Err(KeyError::KeyAlreadyExists);
        }

        let key = MasterKey::generate();
        let encoded = key.encode();

        let existing = match fs::read_to_string(&self.env_file) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(KeyError::PersistenceError {
                    path: self.env_file.clone(),
                    source,
                });
            }
        };

        let updated = set_env_value(&existing, APP_KEY, &encoded);
        write_private(&self.env_file, updated.as_bytes()).map_err(|source| {
            KeyError::PersistenceError {
                path: self.env_file.clone(),
                source,
            }
        })?;

        tracing::info!(
            env_file = %self.env_file.display(),
            replaced = force,
            "Generated application master key"
        );
        Ok(encoded)
    }
}

/// Read `KEY=value` from a dotenv file; surrounding quotes are stripped.
fn read_env_value(path: &Path, key: &str) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    content.lines().rev().find_map(|line| {
        let (name, value) = line.trim_start().split_once('=')?;
        if name.trim() != key {
            return None;
        }
        let value = value.trim();
        let unquoted = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        Some(unquoted.to_string())
    })
}

/// Replace every `KEY=` line (or append one), keeping all other lines intact.
fn set_env_value(content: &str, key: &str, value: &str) -> String {
    let mut replaced = false;
    let mut lines: Vec<String> = Vec::new();

    for line in content.lines() {
        let is_target = line
            .trim_start()
            .split_once('=')
            .is_some_and(|(name, _)| name.trim() == key);
        if is_target {
            if !replaced {
                lines.push(format!("{key}={value}"));
                replaced = true;
            }
        } else {
            lines.push(line.to_string());
        }
    }

    if !replaced {
        lines.push(format!("{key}={value}"));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}
