//! Authenticated encryption for secrets at rest.
//!
//! AES-256-GCM with a fresh 96-bit random nonce per message. The wire
//! form of a sealed message is
//!
//! ```text
//! base64( nonce[12] || tag[16] || ciphertext[..] )
//! ```
//!
//! The master key is carried as [`MasterKey`], which zeroizes on drop and
//! never prints its bytes through `Debug`.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngExt;
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::actions::ErrorKind;

/// Key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Prefix carried by the encoded master key (`APP_KEY=base64:...`).
pub const KEY_PREFIX: &str = "base64:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("key must decode to exactly {KEY_LEN} bytes")]
    InvalidKey,

    #[error("ciphertext payload is malformed")]
    MalformedPayload,

    #[error("ciphertext failed authentication")]
    AuthenticationFailed,
}

impl CipherError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidKey => ErrorKind::InvalidKey,
            Self::MalformedPayload => ErrorKind::MalformedPayload,
            Self::AuthenticationFailed => ErrorKind::AuthenticationFailed,
        }
    }
}

/// The 256-bit application master key.
#[derive(Clone)]
pub struct MasterKey(Zeroizing<[u8; KEY_LEN]>);

impl MasterKey {
    /// Draw a new key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        rand::rng().fill(key.as_mut_slice());
        Self(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.len() != KEY_LEN {
            return Err(CipherError::InvalidKey);
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Parse the `base64:<44 chars>` form.
    pub fn parse(encoded: &str) -> Result<Self, CipherError> {
        let body = encoded
            .trim()
            .strip_prefix(KEY_PREFIX)
            .ok_or(CipherError::InvalidKey)?;
        let bytes = Zeroizing::new(BASE64.decode(body).map_err(|_| CipherError::InvalidKey)?);
        Self::from_bytes(&bytes)
    }

    /// Render as `base64:<44 chars>`.
    pub fn encode(&self) -> String {
        format!("{}{}", KEY_PREFIX, BASE64.encode(self.0.as_slice()))
    }

    fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// AEAD wrapper around a single master key.
pub struct AuthenticatedCipher {
    cipher: Aes256Gcm,
}

impl AuthenticatedCipher {
    pub fn new(key: &MasterKey) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Build from the prefixed base64 form; rejects anything but 32 bytes.
    pub fn from_encoded(encoded: &str) -> Result<Self, CipherError> {
        Ok(Self::new(&MasterKey::parse(encoded)?))
    }

    /// Seal `plaintext` under a fresh nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
            // Only reachable for messages beyond the GCM length limit
            .map_err(|_| CipherError::MalformedPayload)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + TAG_LEN + buffer.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&tag);
        blob.extend_from_slice(&buffer);
        Ok(BASE64.encode(blob))
    }

    /// Open a sealed message. Nothing is returned unless the tag verifies.
    pub fn decrypt(&self, blob: &str) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        let raw = BASE64
            .decode(blob.trim())
            .map_err(|_| CipherError::MalformedPayload)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::MalformedPayload);
        }

        let (nonce, rest) = raw.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut buffer = Zeroizing::new(ciphertext.to_vec());
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                b"",
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| CipherError::AuthenticationFailed)?;
        Ok(buffer)
    }
}

impl fmt::Debug for AuthenticatedCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthenticatedCipher { key: [REDACTED] }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cipher() -> AuthenticatedCipher {
        AuthenticatedCipher::new(&MasterKey::generate())
    }

    #[test]
    fn roundtrip() {
        let c = cipher();
        let blob = c.encrypt(b"-----BEGIN CERTIFICATE-----").unwrap();
        assert_eq!(c.decrypt(&blob).unwrap().as_slice(), b"-----BEGIN CERTIFICATE-----");
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let c = cipher();
        let blob = c.encrypt(b"").unwrap();
        assert_eq!(BASE64.decode(&blob).unwrap().len(), NONCE_LEN + TAG_LEN);
        assert!(c.decrypt(&blob).unwrap().is_empty());
    }

    #[test]
    fn same_plaintext_yields_different_blobs() {
        let c = cipher();
        let a = c.encrypt(b"secret123").unwrap();
        let b = c.encrypt(b"secret123").unwrap();
        assert_ne!(a, b);

        let a = BASE64.decode(a).unwrap();
        let b = BASE64.decode(b).unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn every_flipped_bit_fails_authentication() {
        let c = cipher();
        let blob = BASE64.decode(c.encrypt(b"tamper me").unwrap()).unwrap();

        for byte in 0..blob.len() {
            for bit in 0..8 {
                let mut tampered = blob.clone();
                tampered[byte] ^= 1 << bit;
                let result = c.decrypt(&BASE64.encode(&tampered));
                assert_eq!(
                    result.unwrap_err(),
                    CipherError::AuthenticationFailed,
                    "byte {byte} bit {bit}"
                );
            }
        }
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let blob = cipher().encrypt(b"data").unwrap();
        assert_eq!(
            cipher().decrypt(&blob).unwrap_err(),
            CipherError::AuthenticationFailed
        );
    }

    #[test]
    fn short_or_garbled_payload_is_malformed() {
        let c = cipher();
        let short = BASE64.encode([0u8; NONCE_LEN + TAG_LEN - 1]);
        assert_eq!(c.decrypt(&short).unwrap_err(), CipherError::MalformedPayload);
        assert_eq!(c.decrypt("not base64 !!").unwrap_err(), CipherError::MalformedPayload);
        assert_eq!(c.decrypt("").unwrap_err(), CipherError::MalformedPayload);
    }

    #[test]
    fn key_encoding_roundtrip() {
        let key = MasterKey::generate();
        let encoded = key.encode();
        assert!(encoded.starts_with(KEY_PREFIX));
        assert_eq!(encoded.len(), KEY_PREFIX.len() + 44);

        let parsed = MasterKey::parse(&encoded).unwrap();
        assert_eq!(parsed.as_bytes(), key.as_bytes());
    }

    #[test]
    fn invalid_keys_are_rejected() {
        let short = format!("{}{}", KEY_PREFIX, BASE64.encode([7u8; 16]));
        let unprefixed = BASE64.encode([7u8; KEY_LEN]);

        assert_eq!(MasterKey::parse(&short).unwrap_err(), CipherError::InvalidKey);
        assert_eq!(MasterKey::parse(&unprefixed).unwrap_err(), CipherError::InvalidKey);
        assert_eq!(MasterKey::parse("base64:%%%").unwrap_err(), CipherError::InvalidKey);
        assert!(AuthenticatedCipher::from_encoded(&short).is_err());
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = MasterKey::generate();
        let debug = format!("{:?} {:?}", key, AuthenticatedCipher::new(&key));
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&key.encode()[KEY_PREFIX.len()..]));
    }

    proptest! {
        #[test]
        fn prop_roundtrip(plaintext in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let c = cipher();
            let blob = c.encrypt(&plaintext).unwrap();
            let opened = c.decrypt(&blob).unwrap();
            prop_assert_eq!(opened.as_slice(), plaintext.as_slice());
        }

        #[test]
        fn prop_blob_length(plaintext in proptest::collection::vec(any::<u8>(), 0..1024)) {
            let blob = cipher().encrypt(&plaintext).unwrap();
            prop_assert_eq!(
                BASE64.decode(blob).unwrap().len(),
                NONCE_LEN + TAG_LEN + plaintext.len()
            );
        }
    }
}
