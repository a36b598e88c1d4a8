//! Installer actions and the uniform result envelope.
//!
//! Internal layers return typed `Result`s. [`Installer`] is the boundary
//! where they become an [`ActionResult`]: a success flag, a user-facing
//! message, optional data, and a machine-readable error kind with a
//! detail string meant for logs.

use serde::Serialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::config::Config;
use crate::exec::{CommandExecutor, CommandGuard, CommandWhitelist, ProcessExecutor};
use crate::security::{
    AuditAction, AuditLog, MasterKeyProvisioner, SecretFileStore, SecretStoreError, UploadPolicy,
    UploadedFile,
};

/// Stable, snake_case error identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidKey,
    MalformedPayload,
    AuthenticationFailed,
    PrerequisiteMissing,
    PersistenceError,
    KeyAlreadyExists,
    NotFound,
    InvalidUpload,
    UnsupportedType,
    WriteFailure,
    DecryptionFailed,
    InvalidName,
    NotWhitelisted,
    CommandFailed,
    /// Collapsed form of the secret-lookup failures, shown to clients.
    SecretUnavailable,
    Internal,
}

impl ErrorKind {
    /// Message safe to show to the wizard user.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NotFound
            | Self::DecryptionFailed
            | Self::AuthenticationFailed
            | Self::MalformedPayload
            | Self::SecretUnavailable => "The requested secret is not available.",
            Self::InvalidKey | Self::PrerequisiteMissing => {
                "The application key has not been generated yet."
            }
            Self::PersistenceError => "The application key could not be saved.",
            Self::KeyAlreadyExists => "An application key already exists.",
            Self::InvalidUpload => "The uploaded file is not a valid certificate.",
            Self::UnsupportedType => "This file type is not accepted.",
            Self::WriteFailure => "The file could not be saved.",
            Self::InvalidName => "The name is not valid.",
            Self::NotWhitelisted => "This command is not allowed.",
            Self::CommandFailed => "The command did not complete successfully.",
            Self::Internal => "An internal error occurred.",
        }
    }

    /// Kind as exposed over HTTP; lookup failures are indistinguishable.
    pub fn public(&self) -> Self {
        match self {
            Self::NotFound
            | Self::DecryptionFailed
            | Self::AuthenticationFailed
            | Self::MalformedPayload => Self::SecretUnavailable,
            other => *other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidKey => "invalid_key",
            Self::MalformedPayload => "malformed_payload",
            Self::AuthenticationFailed => "authentication_failed",
            Self::PrerequisiteMissing => "prerequisite_missing",
            Self::PersistenceError => "persistence_error",
            Self::KeyAlreadyExists => "key_already_exists",
            Self::NotFound => "not_found",
            Self::InvalidUpload => "invalid_upload",
            Self::UnsupportedType => "unsupported_type",
            Self::WriteFailure => "write_failure",
            Self::DecryptionFailed => "decryption_failed",
            Self::InvalidName => "invalid_name",
            Self::NotWhitelisted => "not_whitelisted",
            Self::CommandFailed => "command_failed",
            Self::SecretUnavailable => "secret_unavailable",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActionError {
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
            error: None,
        }
    }

    pub fn failure(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            message: kind.user_message().to_string(),
            data: None,
            error: Some(ActionError {
                kind,
                detail: Some(detail.into()),
            }),
        }
    }

    /// Attach data to a result (e.g. command output on failure).
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Strip log-only detail and collapse oracle-sensitive kinds.
    pub fn for_client(mut self) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.kind = error.kind.public();
            error.detail = None;
        }
        self
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Every installer operation the wizard and the CLI can trigger.
pub struct Installer {
    provisioner: MasterKeyProvisioner,
    secrets_dir: PathBuf,
    upload_policy: UploadPolicy,
    guard: CommandGuard,
    audit: AuditLog,
    source: &'static str,
}

impl Installer {
    pub fn new(
        provisioner: MasterKeyProvisioner,
        secrets_dir: impl Into<PathBuf>,
        upload_policy: UploadPolicy,
        guard: CommandGuard,
        audit: AuditLog,
    ) -> Self {
        Self {
            provisioner,
            secrets_dir: secrets_dir.into(),
            upload_policy,
            guard,
            audit,
            source: "cli",
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::with_executor(config, Arc::new(ProcessExecutor::new(config.command_timeout())))
    }

    pub fn with_executor(config: &Config, executor: Arc<dyn CommandExecutor>) -> Self {
        let guard = CommandGuard::new(
            CommandWhitelist::installer_default(),
            executor,
            config.app_root(),
        );
        Self::new(
            MasterKeyProvisioner::new(config.env_file()),
            config.secrets_dir(),
            config.secrets.upload_policy(),
            guard,
            AuditLog::new(config.paths.audit_log()),
        )
    }

    /// Label recorded in the audit log (`cli`, `http`).
    pub fn with_source(mut self, source: &'static str) -> Self {
        self.source = source;
        self
    }

    pub fn provisioner(&self) -> &MasterKeyProvisioner {
        &self.provisioner
    }

    pub fn guard(&self) -> &CommandGuard {
        &self.guard
    }

    /// Open the secret store; fails with `PrerequisiteMissing` without a key.
    pub fn secret_store(&self) -> Result<SecretFileStore, SecretStoreError> {
        Ok(SecretFileStore::open(&self.secrets_dir, &self.provisioner)?
            .with_upload_policy(self.upload_policy.clone()))
    }

    pub fn status(&self) -> ActionResult {
        let key_exists = self.provisioner.key_exists();
        // No key yet simply means nothing can be stored yet
        let (secrets, secrets_error) = match self.secret_store().and_then(|s| s.list()) {
            Ok(list) => (list, None),
            Err(e) if e.kind() == ErrorKind::PrerequisiteMissing => (Vec::new(), None),
            Err(e) => {
                tracing::error!(error = %e, "Failed to list secrets for status");
                (Vec::new(), Some(e.kind().public()))
            }
        };
        ActionResult::ok(
            "Installer status",
            Some(json!({
                "key_exists": key_exists,
                "secrets": secrets,
                "secrets_error": secrets_error,
                "commands": self.whitelist_data(),
            })),
        )
    }

    pub fn generate_key(&self, force: bool) -> ActionResult {
        match self.provisioner.generate(force) {
            Ok(_) => {
                self.audit.record(
                    AuditAction::KeyGenerated,
                    "APP_KEY",
                    self.source,
                    force.then_some("forced"),
                );
                // The key itself never leaves the env file through this path
                ActionResult::ok("Application key generated", None)
            }
            Err(e) => self.fail(e.kind(), &e),
        }
    }

    pub fn store_secret(&self, name: &str, content: &[u8], password: Option<&str>) -> ActionResult {
        let result = self
            .secret_store()
            .and_then(|store| store.store(name, content, password));
        self.stored(result)
    }

    pub fn store_certificate(
        &self,
        upload: &UploadedFile,
        name: &str,
        password: Option<&str>,
    ) -> ActionResult {
        let result = self
            .secret_store()
            .and_then(|store| store.store_upload(upload, name, password));
        self.stored(result)
    }

    pub fn retrieve_secret(&self, name: &str) -> Result<Zeroizing<Vec<u8>>, SecretStoreError> {
        self.secret_store()?.retrieve(name)
    }

    pub fn retrieve_password(&self, name: &str) -> Result<Zeroizing<String>, SecretStoreError> {
        self.secret_store()?.retrieve_password(name)
    }

    pub fn delete_secret(&self, name: &str) -> ActionResult {
        match self.secret_store().and_then(|store| {
            let stem = crate::security::sanitize_name(name)?;
            store.delete(&stem).map(|()| stem)
        }) {
            Ok(stem) => {
                self.audit
                    .record(AuditAction::SecretDeleted, &stem, self.source, None);
                ActionResult::ok("Secret deleted", Some(json!({ "name": stem })))
            }
            Err(e) => self.fail(e.kind(), &e),
        }
    }

    pub fn list_secrets(&self) -> ActionResult {
        match self.secret_store().and_then(|store| store.list()) {
            Ok(list) => ActionResult::ok("Stored secrets", Some(json!(list))),
            Err(e) => self.fail(e.kind(), &e),
        }
    }

    pub fn list_commands(&self) -> ActionResult {
        ActionResult::ok("Allowed commands", Some(self.whitelist_data()))
    }

    pub async fn run_command(&self, binary: &str, args: &[String]) -> ActionResult {
        match self.guard.run(binary, args).await {
            Ok(output) => {
                self.audit.record(
                    AuditAction::CommandExecuted,
                    &output.command,
                    self.source,
                    Some("exit 0"),
                );
                ActionResult::ok("Command completed", Some(json!(output)))
            }
            Err(e) => {
                let (action, data) = match &e {
                    crate::exec::CommandError::NotWhitelisted { command } => {
                        (AuditAction::CommandRejected, json!({ "command": command }))
                    }
                    crate::exec::CommandError::CommandFailed {
                        command,
                        output,
                        exit_code,
                    } => (
                        AuditAction::CommandExecuted,
                        json!({ "command": command, "output": output, "exit_code": exit_code }),
                    ),
                };
                let subject = crate::exec::guard::display_command(binary, args);
                self.audit
                    .record(action, &subject, self.source, Some(e.kind().as_str()));
                self.fail(e.kind(), &e).with_data(data)
            }
        }
    }

    fn whitelist_data(&self) -> Value {
        let entries: Vec<Value> = self
            .guard
            .whitelist()
            .iter()
            .map(|(binary, prefix)| json!({ "binary": binary, "args": prefix }))
            .collect();
        Value::Array(entries)
    }

    fn stored(
        &self,
        result: Result<crate::security::SecretMetadata, SecretStoreError>,
    ) -> ActionResult {
        match result {
            Ok(meta) => {
                self.audit.record(
                    AuditAction::SecretStored,
                    &meta.name,
                    self.source,
                    meta.has_password.then_some("with password"),
                );
                ActionResult::ok("Secret stored", Some(json!(meta)))
            }
            Err(e) => self.fail(e.kind(), &e),
        }
    }

    fn fail(&self, kind: ErrorKind, error: &dyn std::error::Error) -> ActionResult {
        tracing::warn!(kind = kind.as_str(), error = %error, "Installer action failed");
        ActionResult::failure(kind, error.to_string())
    }
}
