// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! At-rest encryption of sensitive instance details.
//!
//! Sealed values are laid out as `nonce (12 bytes) || ciphertext`, using
//! AES-256-GCM with a fresh random nonce per seal.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use zeroize::Zeroizing;

use crate::error::{CoreError, Result};
use crate::instance::SecureDetailBag;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Seals and opens [`SecureDetailBag`]s.
#[derive(Clone)]
pub struct SecretCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCipher")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl SecretCipher {
    /// Create a cipher from raw key bytes.
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Create a cipher from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| CoreError::Encryption(format!("invalid base64 key: {}", e)))?,
        );
        let key: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            CoreError::Encryption(format!(
                "key must be {} bytes, got {}",
                KEY_LEN,
                decoded.len()
            ))
        })?;
        Ok(Self::new(key))
    }

    /// Create a cipher with a random key.
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(key.as_slice());
        Self::new(bytes)
    }

    /// Encrypt a secure bag.
    pub fn seal(&self, bag: &SecureDetailBag) -> Result<Vec<u8>> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(bag)
                .map_err(|e| CoreError::Encryption(format!("failed to encode: {}", e)))?,
        );
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| CoreError::Encryption("seal failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a value produced by [`SecretCipher::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<SecureDetailBag> {
        if sealed.len() < NONCE_LEN {
            return Err(CoreError::Encryption("sealed value too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = Zeroizing::new(
            self.cipher()
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| {
                    CoreError::Encryption("open failed: wrong key or tampered value".to_string())
                })?,
        );
        serde_json::from_slice(&plaintext)
            .map_err(|e| CoreError::Encryption(format!("failed to decode: {}", e)))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_slice()))
    }
}
