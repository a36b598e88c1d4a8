//! Encrypted, file-per-secret storage for certificates and passwords.
//!
//! Each secret is sealed with the [`AuthenticatedCipher`] and written as
//! `<name>.enc` inside the storage directory. An optional password for
//! the secret (e.g. the PKCS#12 passphrase) is sealed separately as
//! `<name>.pwd.enc`. Plaintext is never written to disk.
//!
//! Names are sanitized before they reach the filesystem: path
//! components are stripped, every character outside `[A-Za-z0-9._-]`
//! becomes `_`, and the result is capped at [`MAX_NAME_LEN`]. A name can
//! therefore never address a file outside the storage directory.

use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

use super::cipher::{AuthenticatedCipher, CipherError};
use super::master_key::{KeyError, MasterKeyProvisioner};
use crate::actions::ErrorKind;
use crate::concurrency::write_private;

/// Suffix of a sealed secret.
pub const SECRET_SUFFIX: &str = ".enc";

/// Suffix of a sealed secret's paired password.
pub const PASSWORD_SUFFIX: &str = ".pwd.enc";

/// Secret names may not end with this; they would collide with a password file.
const PASSWORD_MARKER: &str = ".pwd";

/// Maximum length of a sanitized name (before the suffix).
pub const MAX_NAME_LEN: usize = 100;

/// Certificate extensions accepted by [`SecretFileStore::store_upload`].
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &["p12", "pfx", "pem", "cer", "crt"];

/// Default upload size ceiling (10 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret '{0}' not found")]
    NotFound(String),

    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    #[error("unsupported file type '{0}'")]
    UnsupportedType(String),

    #[error("failed to write {path}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("secret '{name}' could not be decrypted: {source}")]
    DecryptionFailed {
        name: String,
        #[source]
        source: CipherError,
    },

    #[error("secret name '{0}' is empty after sanitization")]
    InvalidName(String),

    #[error(transparent)]
    Prerequisite(#[from] KeyError),
}

impl SecretStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidUpload(_) => ErrorKind::InvalidUpload,
            Self::UnsupportedType(_) => ErrorKind::UnsupportedType,
            Self::WriteFailure { .. } => ErrorKind::WriteFailure,
            Self::DecryptionFailed { .. } => ErrorKind::DecryptionFailed,
            Self::InvalidName(_) => ErrorKind::InvalidName,
            Self::Prerequisite(e) => e.kind(),
        }
    }
}

/// What was stored, returned to callers after a successful write.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SecretMetadata {
    /// Sanitized name the secret is stored under.
    pub name: String,
    #[serde(skip_serializing)]
    pub path: PathBuf,
    /// Size of the sealed file in bytes.
    pub size: u64,
    pub has_password: bool,
}

/// A certificate artifact received from the wizard.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Client-side filename; only its extension is trusted, and only after checks.
    pub original_name: String,
    pub bytes: Vec<u8>,
}

/// Upload acceptance rules.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_bytes: u64,
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
        }
    }
}

pub struct SecretFileStore {
    dir: PathBuf,
    cipher: AuthenticatedCipher,
    upload_policy: UploadPolicy,
}

impl SecretFileStore {
    /// Open a store over `dir`, creating it with mode 0700 when missing.
    pub fn new(dir: impl Into<PathBuf>, cipher: AuthenticatedCipher) -> Result<Self, SecretStoreError> {
        let dir = dir.into();
        crate::paths::create_dir_with_mode(&dir).map_err(|e| SecretStoreError::WriteFailure {
            path: dir.clone(),
            source: io::Error::other(e.to_string()),
        })?;
        Ok(Self {
            dir,
            cipher,
            upload_policy: UploadPolicy::default(),
        })
    }

    /// Open a store keyed by the provisioned master key.
    ///
    /// Fails fast with `PrerequisiteMissing` when no valid key exists.
    pub fn open(
        dir: impl Into<PathBuf>,
        provisioner: &MasterKeyProvisioner,
    ) -> Result<Self, SecretStoreError> {
        let cipher = provisioner.cipher()?;
        Self::new(dir, cipher)
    }

    pub fn with_upload_policy(mut self, policy: UploadPolicy) -> Self {
        self.upload_policy = policy;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Seal `content` (and optionally its password) under `name`.
    pub fn store(
        &self,
        name: &str,
        content: &[u8],
        password: Option<&str>,
    ) -> Result<SecretMetadata, SecretStoreError> {
        let stem = sanitize_name(name)?;
        let path = self.secret_path(&stem);
        let password_path = self.password_path(&stem);

        let sealed = self.seal(content, &path)?;
        write_private(&path, sealed.as_bytes()).map_err(|source| SecretStoreError::WriteFailure {
            path: path.clone(),
            source,
        })?;

        match password {
            Some(password) => {
                let sealed = self.seal(password.as_bytes(), &password_path)?;
                write_private(&password_path, sealed.as_bytes()).map_err(|source| {
                    SecretStoreError::WriteFailure {
                        path: password_path.clone(),
                        source,
                    }
                })?;
            }
            // A stale password from an earlier store must not pair with new content
            None => remove_if_present(&password_path).map_err(|source| {
                SecretStoreError::WriteFailure {
                    path: password_path.clone(),
                    source,
                }
            })?,
        }

        tracing::info!(secret = %stem, has_password = password.is_some(), "Stored encrypted secret");

        Ok(SecretMetadata {
            name: stem,
            size: sealed.len() as u64,
            path,
            has_password: password.is_some(),
        })
    }

    /// Validate a certificate upload, then store it.
    pub fn store_upload(
        &self,
        upload: &UploadedFile,
        name: &str,
        password: Option<&str>,
    ) -> Result<SecretMetadata, SecretStoreError> {
        validate_upload(upload, &self.upload_policy)?;
        self.store(name, &upload.bytes, password)
    }

    /// Decrypt and return the secret stored under `name`.
    pub fn retrieve(&self, name: &str) -> Result<Zeroizing<Vec<u8>>, SecretStoreError> {
        let stem = sanitize_name(name)?;
        self.open_sealed(&self.secret_path(&stem), &stem)
    }

    /// Decrypt the password paired with `name`.
    pub fn retrieve_password(&self, name: &str) -> Result<Zeroizing<String>, SecretStoreError> {
        let stem = sanitize_name(name)?;
        let bytes = self.open_sealed(&self.password_path(&stem), &stem)?;
        let text = std::str::from_utf8(&bytes).map_err(|_| SecretStoreError::DecryptionFailed {
            name: stem.clone(),
            source: CipherError::MalformedPayload,
        })?;
        Ok(Zeroizing::new(text.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        sanitize_name(name)
            .map(|stem| self.secret_path(&stem).is_file())
            .unwrap_or(false)
    }

    /// Remove the secret and its paired password file.
    pub fn delete(&self, name: &str) -> Result<(), SecretStoreError> {
        let stem = sanitize_name(name)?;
        let path = self.secret_path(&stem);

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SecretStoreError::NotFound(stem));
            }
            Err(source) => return Err(SecretStoreError::WriteFailure { path, source }),
        }

        let password_path = self.password_path(&stem);
        remove_if_present(&password_path).map_err(|source| SecretStoreError::WriteFailure {
            path: password_path,
            source,
        })?;

        tracing::info!(secret = %stem, "Deleted encrypted secret");
        Ok(())
    }

    /// Metadata for every stored secret, sorted by name.
    pub fn list(&self) -> Result<Vec<SecretMetadata>, SecretStoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| SecretStoreError::WriteFailure {
            path: self.dir.clone(),
            source,
        })?;

        let mut secrets = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.ends_with(PASSWORD_SUFFIX) {
                continue;
            }
            let Some(stem) = file_name.strip_suffix(SECRET_SUFFIX) else {
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            secrets.push(SecretMetadata {
                name: stem.to_string(),
                path: entry.path(),
                size,
                has_password: self.password_path(stem).is_file(),
            });
        }

        secrets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(secrets)
    }

    fn seal(&self, plaintext: &[u8], path: &Path) -> Result<String, SecretStoreError> {
        self.cipher
            .encrypt(plaintext)
            .map_err(|e| SecretStoreError::WriteFailure {
                path: path.to_path_buf(),
                source: io::Error::other(e.to_string()),
            })
    }

    fn open_sealed(&self, path: &Path, stem: &str) -> Result<Zeroizing<Vec<u8>>, SecretStoreError> {
        let blob = match fs::read_to_string(path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SecretStoreError::NotFound(stem.to_string()));
            }
            // Non-UTF-8 content can only be a damaged file
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(SecretStoreError::DecryptionFailed {
                    name: stem.to_string(),
                    source: CipherError::MalformedPayload,
                });
            }
            Err(source) => {
                return Err(SecretStoreError::WriteFailure {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        self.cipher.decrypt(&blob).map_err(|source| {
            tracing::warn!(secret = %stem, error = %source, "Secret failed to decrypt");
            SecretStoreError::DecryptionFailed {
                name: stem.to_string(),
                source,
            }
        })
    }

    fn secret_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}{SECRET_SUFFIX}"))
    }

    fn password_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}{PASSWORD_SUFFIX}"))
    }
}

/// Reduce a caller-supplied name to a safe filename stem.
pub fn sanitize_name(name: &str) -> Result<String, SecretStoreError> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);

    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();

    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        return Err(SecretStoreError::InvalidName(name.to_string()));
    }
    // `<stem>.pwd.enc` is the paired password file of `<stem>`
    if sanitized.to_ascii_lowercase().ends_with(PASSWORD_MARKER) {
        return Err(SecretStoreError::InvalidName(name.to_string()));
    }
    Ok(sanitized)
}

/// Check an upload against size, extension, and content-shape rules.
pub fn validate_upload(upload: &UploadedFile, policy: &UploadPolicy) -> Result<(), SecretStoreError> {
    let extension = Path::new(&upload.original_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    if extension.is_empty() || !policy.allowed_extensions.iter().any(|e| e.eq_ignore_ascii_case(&extension)) {
        return Err(SecretStoreError::UnsupportedType(extension));
    }

    if upload.bytes.is_empty() {
        return Err(SecretStoreError::InvalidUpload("file is empty".to_string()));
    }

    if upload.bytes.len() as u64 > policy.max_bytes {
        return Err(SecretStoreError::InvalidUpload(format!(
            "file is {} bytes; limit is {} bytes",
            upload.bytes.len(),
            policy.max_bytes
        )));
    }

    let pem = looks_like_pem(&upload.bytes);
    let der = looks_like_der(&upload.bytes);
    let genuine = match extension.as_str() {
        "pem" => pem,
        "p12" | "pfx" => der,
        "cer" | "crt" => pem || der,
        // Operator-added extensions only get the generic shape check
        _ => pem || der,
    };

    if !genuine {
        return Err(SecretStoreError::InvalidUpload(format!(
            "content is not a valid .{extension} certificate artifact"
        )));
    }

    Ok(())
}

fn looks_like_pem(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(4096)];
    head.windows(11).any(|w| w == b"-----BEGIN ")
}

/// ASN.1 DER: a constructed SEQUENCE (0x30) with a plausible length byte.
fn looks_like_der(bytes: &[u8]) -> bool {
    match bytes {
        [0x30, len, ..] => *len != 0x80 && *len <= 0x84,
        _ => false,
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::cipher::MasterKey;

    fn store(dir: &Path) -> SecretFileStore {
        SecretFileStore::new(dir.join("secrets"), AuthenticatedCipher::new(&MasterKey::generate()))
            .unwrap()
    }

    fn p12_bytes() -> Vec<u8> {
        let mut bytes = vec![0x30, 0x82, 0x0a, 0x1b];
        bytes.extend_from_slice(&[0xAB; 64]);
        bytes
    }

    #[test]
    fn sanitize_strips_path_components() {
        assert_eq!(sanitize_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_name("..\\..\\boot.ini").unwrap(), "boot.ini");
        assert_eq!(sanitize_name("client.p12").unwrap(), "client.p12");
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_name("firma digital$(1).p12").unwrap(), "firma_digital__1_.p12");
        assert_eq!(sanitize_name("año.pem").unwrap(), "a_o.pem");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "a".repeat(300);
        assert_eq!(sanitize_name(&long).unwrap().len(), MAX_NAME_LEN);
    }

    #[test]
    fn sanitize_rejects_empty_names() {
        assert!(matches!(sanitize_name(""), Err(SecretStoreError::InvalidName(_))));
        assert!(matches!(sanitize_name("dir/"), Err(SecretStoreError::InvalidName(_))));
        assert!(matches!(sanitize_name(".."), Err(SecretStoreError::InvalidName(_))));
    }

    #[test]
    fn sanitize_rejects_password_file_stems() {
        for name in ["client.p12.pwd", "x.PWD", "../a.pwd", ".pwd"] {
            assert!(
                matches!(sanitize_name(name), Err(SecretStoreError::InvalidName(_))),
                "{name}"
            );
        }
        assert_eq!(sanitize_name("pwd").unwrap(), "pwd");
        assert_eq!(sanitize_name("client.pwdx").unwrap(), "client.pwdx");
    }

    #[test]
    fn secret_named_like_a_password_cannot_shadow_one() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        s.store("client.p12", &p12_bytes(), Some("secret123")).unwrap();

        let err = s.store("client.p12.pwd", b"OTHER", None).unwrap_err();
        assert!(matches!(err, SecretStoreError::InvalidName(_)));
        assert!(matches!(s.delete("client.p12.pwd"), Err(SecretStoreError::InvalidName(_))));

        assert_eq!(s.retrieve_password("client.p12").unwrap().as_str(), "secret123");
        let names: Vec<_> = s.list().unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["client.p12"]);
    }

    #[test]
    fn traversal_name_stays_inside_storage_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());

        let meta = s.store("../../etc/passwd", b"root:x:0:0", None).unwrap();
        assert_eq!(meta.path.parent().unwrap(), s.dir());
        let file_name = meta.path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(!file_name.contains('/') && !file_name.contains('\\'));
        assert_eq!(file_name, "passwd.enc");
        assert!(!tmp.path().join("etc").exists());
    }

    #[test]
    fn plaintext_never_touches_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        let meta = s.store("client.p12", b"PLAINTEXT-CERT", Some("secret123")).unwrap();

        let sealed = fs::read_to_string(&meta.path).unwrap();
        assert!(!sealed.contains("PLAINTEXT-CERT"));
        let sealed_pwd = fs::read_to_string(s.password_path("client.p12")).unwrap();
        assert!(!sealed_pwd.contains("secret123"));
    }

    #[test]
    fn store_retrieve_delete_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        let cert = p12_bytes();

        let meta = s.store("client.p12", &cert, Some("secret123")).unwrap();
        assert!(meta.has_password);
        assert_eq!(meta.size, fs::metadata(&meta.path).unwrap().len());
        assert!(s.exists("client.p12"));
        assert!(s.dir().join("client.p12.enc").is_file());
        assert!(s.dir().join("client.p12.pwd.enc").is_file());

        assert_eq!(s.retrieve("client.p12").unwrap().as_slice(), cert.as_slice());
        assert_eq!(s.retrieve_password("client.p12").unwrap().as_str(), "secret123");

        s.delete("client.p12").unwrap();
        assert!(!s.dir().join("client.p12.enc").exists());
        assert!(!s.dir().join("client.p12.pwd.enc").exists());
        assert!(matches!(s.retrieve("client.p12"), Err(SecretStoreError::NotFound(_))));
        assert!(matches!(s.delete("client.p12"), Err(SecretStoreError::NotFound(_))));
    }

    #[test]
    fn restore_without_password_drops_stale_password() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        s.store("client.p12", b"v1", Some("old")).unwrap();
        s.store("client.p12", b"v2", None).unwrap();

        assert!(matches!(
            s.retrieve_password("client.p12"),
            Err(SecretStoreError::NotFound(_))
        ));
    }

    #[test]
    fn corrupted_file_fails_decryption() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        let meta = s.store("db-password", b"hunter2", None).unwrap();

        fs::write(&meta.path, "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
        let err = s.retrieve("db-password").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecryptionFailed);
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let tmp = tempfile::tempdir().unwrap();
        let first = store(tmp.path());
        first.store("client.pem", b"cert", None).unwrap();

        let second = store(tmp.path());
        assert!(matches!(
            second.retrieve("client.pem"),
            Err(SecretStoreError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn open_without_key_fails_fast() {
        let tmp = tempfile::tempdir().unwrap();
        let provisioner = MasterKeyProvisioner::new(tmp.path().join(".env"));
        let err = SecretFileStore::open(tmp.path().join("secrets"), &provisioner)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::PrerequisiteMissing);
        assert!(!tmp.path().join("secrets").exists());
    }

    #[test]
    fn list_reports_stored_secrets() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        s.store("b.pem", b"b", None).unwrap();
        s.store("a.p12", b"a", Some("pw")).unwrap();

        let listed = s.list().unwrap();
        let names: Vec<_> = listed.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["a.p12", "b.pem"]);
        assert!(listed[0].has_password);
        assert!(!listed[1].has_password);
    }

    #[cfg(unix)]
    #[test]
    fn storage_permissions_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        let meta = s.store("client.pem", b"cert", Some("pw")).unwrap();

        let dir_mode = fs::metadata(s.dir()).unwrap().permissions().mode();
        let file_mode = fs::metadata(&meta.path).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[test]
    fn upload_validation() {
        let policy = UploadPolicy::default();
        let upload = |name: &str, bytes: &[u8]| UploadedFile {
            original_name: name.to_string(),
            bytes: bytes.to_vec(),
        };

        assert!(validate_upload(&upload("firma.P12", &p12_bytes()), &policy).is_ok());
        assert!(
            validate_upload(&upload("ca.pem", b"-----BEGIN CERTIFICATE-----\nMII\n"), &policy)
                .is_ok()
        );
        assert!(validate_upload(&upload("ca.crt", &p12_bytes()), &policy).is_ok());

        assert!(matches!(
            validate_upload(&upload("shell.php", b"<?php"), &policy),
            Err(SecretStoreError::UnsupportedType(_))
        ));
        assert!(matches!(
            validate_upload(&upload("noext", &p12_bytes()), &policy),
            Err(SecretStoreError::UnsupportedType(_))
        ));
        assert!(matches!(
            validate_upload(&upload("empty.p12", b""), &policy),
            Err(SecretStoreError::InvalidUpload(_))
        ));
        assert!(matches!(
            validate_upload(&upload("fake.p12", b"GIF89a...."), &policy),
            Err(SecretStoreError::InvalidUpload(_))
        ));
        assert!(matches!(
            validate_upload(&upload("fake.pem", &p12_bytes()), &policy),
            Err(SecretStoreError::InvalidUpload(_))
        ));
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let policy = UploadPolicy {
            max_bytes: 16,
            ..UploadPolicy::default()
        };
        let upload = UploadedFile {
            original_name: "big.p12".to_string(),
            bytes: p12_bytes(),
        };
        assert!(matches!(
            validate_upload(&upload, &policy),
            Err(SecretStoreError::InvalidUpload(_))
        ));
    }

    #[test]
    fn store_upload_delegates_to_store() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(tmp.path());
        let upload = UploadedFile {
            original_name: "C:\\fakepath\\firma.p12".to_string(),
            bytes: p12_bytes(),
        };

        let meta = s.store_upload(&upload, "client.p12", Some("secret123")).unwrap();
        assert_eq!(meta.name, "client.p12");
        assert_eq!(s.retrieve("client.p12").unwrap().as_slice(), upload.bytes.as_slice());
    }
}
