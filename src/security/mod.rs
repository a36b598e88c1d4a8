//! Cryptographic core of the installer.
//!
//! ```text
//!   MasterKeyProvisioner ──(APP_KEY in .env)──► MasterKey
//!                                                  │
//!                                                  ▼
//!   SecretFileStore ──────────────────────► AuthenticatedCipher
//!     <name>.enc / <name>.pwd.enc              AES-256-GCM
//! ```
//!
//! Security-relevant events from every layer go to the hash-chained
//! [`AuditLog`].

pub mod audit;
pub mod cipher;
pub mod master_key;
pub mod secret_store;

pub use audit::{AuditAction, AuditEntry, AuditLog};
pub use cipher::{AuthenticatedCipher, CipherError, MasterKey};
pub use master_key::{KeyError, MasterKeyProvisioner};
pub use secret_store::{
    SecretFileStore, SecretMetadata, SecretStoreError, UploadPolicy, UploadedFile, sanitize_name,
};
