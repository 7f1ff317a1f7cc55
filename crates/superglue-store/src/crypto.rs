// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! AES-256-GCM envelope encryption for `Integration` credentials at rest.
//!
//! The plaintext/ciphertext boundary sits at the datastore edge (spec.md
//! §9 "Credential encryption"): every backend stores an envelope, every
//! `get`/`list` call returns cleartext. There is no key recovery — losing
//! `MASTER_ENCRYPTION_KEY` makes previously stored credentials
//! unrecoverable, by design.

use crate::error::{Result, StoreError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// Derives a 32-byte AES-256 key from the raw `MASTER_ENCRYPTION_KEY`
/// value. Hashing (rather than requiring exactly 32 raw bytes) lets an
/// operator supply any passphrase while still getting a key of the right
/// length, deterministically.
#[derive(Clone)]
pub struct CredentialCipher {
    key: Key<Aes256Gcm>,
}

impl CredentialCipher {
    pub fn new(master_key: &str) -> Self {
        let digest = Sha256::digest(master_key.as_bytes());
        Self {
            key: *Key::<Aes256Gcm>::from_slice(digest.as_slice()),
        }
    }

    /// Reads `MASTER_ENCRYPTION_KEY` from the environment. Required by
    /// every backend that stores `Integration` credentials; there is no
    /// fallback — an unset key is a startup error, not a silently-disabled
    /// feature.
    pub fn from_env() -> Result<Self> {
        let master_key = std::env::var("MASTER_ENCRYPTION_KEY")
            .map_err(|_| StoreError::MissingConfig("MASTER_ENCRYPTION_KEY"))?;
        Ok(Self::new(&master_key))
    }

    /// Encrypts `plaintext`, returning a base64 envelope of `nonce ||
    /// ciphertext`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(&self.key);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| StoreError::Crypto(e.to_string()))?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(envelope))
    }

    /// Decrypts an envelope produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, envelope: &str) -> Result<String> {
        let raw = STANDARD
            .decode(envelope)
            .map_err(|e| StoreError::Crypto(format!("invalid base64 envelope: {e}")))?;
        if raw.len() < NONCE_LEN {
            return Err(StoreError::Crypto("envelope shorter than nonce".to_string()));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let cipher = Aes256Gcm::new(&self.key);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|e| StoreError::Crypto(e.to_string()))
    }

    /// Encrypts every value in a flat credential map, leaving keys as-is.
    pub fn encrypt_map(
        &self,
        credentials: &std::collections::HashMap<String, String>,
    ) -> Result<std::collections::HashMap<String, String>> {
        credentials
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.encrypt(v)?)))
            .collect()
    }

    /// Decrypts every value in a flat credential map, leaving keys as-is.
    pub fn decrypt_map(
        &self,
        envelopes: &std::collections::HashMap<String, String>,
    ) -> Result<std::collections::HashMap<String, String>> {
        envelopes
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.decrypt(v)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plaintext() {
        let cipher = CredentialCipher::new("test-master-key-for-unit-tests");
        let envelope = cipher.encrypt("sk-super-secret-123").unwrap();
        assert_ne!(envelope, "sk-super-secret-123");
        assert_eq!(cipher.decrypt(&envelope).unwrap(), "sk-super-secret-123");
    }

    #[test]
    fn different_calls_produce_different_envelopes() {
        let cipher = CredentialCipher::new("test-master-key-for-unit-tests");
        let a = cipher.encrypt("same-value").unwrap();
        let b = cipher.encrypt("same-value").unwrap();
        assert_ne!(a, b, "random nonce should vary envelope bytes");
        assert_eq!(cipher.decrypt(&a).unwrap(), "same-value");
        assert_eq!(cipher.decrypt(&b).unwrap(), "same-value");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let cipher_a = CredentialCipher::new("key-a");
        let cipher_b = CredentialCipher::new("key-b");
        let envelope = cipher_a.encrypt("secret").unwrap();
        assert!(cipher_b.decrypt(&envelope).is_err());
    }
}
