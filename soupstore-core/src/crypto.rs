//! Value encryption for external blobs
//!
//! Encrypted blob format:
//! ```text
//! [Magic: 8 bytes "SSBL0001"]
//! [Version: 1 byte]
//! [Salt: 16 bytes]
//! [Nonce: 12 bytes]
//! [Ciphertext + AEAD tag: variable]
//! ```

use crate::config::CryptoConfig;
use crate::errors::{StoreError, StoreResult};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::OsRng;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{Argon2, Params};
use std::fmt;
use zeroize::Zeroizing;

/// Magic header for encrypted blob files
const MAGIC_HEADER: &[u8; 8] = b"SSBL0001";

/// Current blob format version
const FORMAT_VERSION: u8 = 1;

/// Salt length for Argon2 KDF (16 bytes = 128 bits)
const SALT_LEN: usize = 16;

/// Nonce length for AES-GCM (12 bytes = 96 bits)
const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length
const TAG_LEN: usize = 16;

/// Header size: magic(8) + version(1) + salt(16) + nonce(12) = 37 bytes
const HEADER_SIZE: usize = 8 + 1 + SALT_LEN + NONCE_LEN;

/// Caller-supplied secret protecting a store. Never persisted.
#[derive(Clone)]
pub struct EncryptionKey(Zeroizing<String>);

impl EncryptionKey {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

impl From<&str> for EncryptionKey {
    fn from(secret: &str) -> Self {
        Self::new(secret)
    }
}

/// Opaque encrypt/decrypt capability used by the blob store and key rotation
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], key: &EncryptionKey) -> StoreResult<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8], key: &EncryptionKey) -> StoreResult<Vec<u8>>;
}

/// AES-256-GCM with an Argon2id-stretched key and a fresh salt and nonce per value
#[derive(Debug, Clone)]
pub struct AesGcmCipher {
    params: Params,
}

impl AesGcmCipher {
    pub fn new(config: &CryptoConfig) -> StoreResult<Self> {
        let params = Params::new(
            config.kdf_memory_kib,
            config.kdf_iterations,
            config.kdf_parallelism,
            Some(32),
        )
        .map_err(|e| StoreError::Encryption(format!("Invalid Argon2 params: {}", e)))?;

        Ok(Self { params })
    }

    fn derive_key(&self, key: &EncryptionKey, salt: &[u8]) -> StoreResult<Zeroizing<[u8; 32]>> {
        let argon2 = Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            self.params.clone(),
        );

        let mut derived = Zeroizing::new([0u8; 32]);
        argon2
            .hash_password_into(key.expose().as_bytes(), salt, &mut *derived)
            .map_err(|e| StoreError::Encryption(format!("Key derivation failed: {}", e)))?;

        Ok(derived)
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8], key: &EncryptionKey) -> StoreResult<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let derived = self.derive_key(key, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(&*derived)
            .map_err(|e| StoreError::Encryption(format!("Invalid key: {}", e)))?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| StoreError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut result = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        result.extend_from_slice(MAGIC_HEADER);
        result.push(FORMAT_VERSION);
        result.extend_from_slice(&salt);
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    fn decrypt(&self, data: &[u8], key: &EncryptionKey) -> StoreResult<Vec<u8>> {
        if data.len() < HEADER_SIZE + TAG_LEN {
            return Err(StoreError::Encryption("Truncated blob".to_string()));
        }
        if &data[0..8] != MAGIC_HEADER {
            return Err(StoreError::Encryption("Invalid magic header".to_string()));
        }
        let version = data[8];
        if version != FORMAT_VERSION {
            return Err(StoreError::Encryption(format!(
                "Unsupported blob version: {}",
                version
            )));
        }

        let salt = &data[9..9 + SALT_LEN];
        let nonce_bytes = &data[9 + SALT_LEN..HEADER_SIZE];
        let ciphertext = &data[HEADER_SIZE..];

        let derived = self.derive_key(key, salt)?;
        let cipher = Aes256Gcm::new_from_slice(&*derived)
            .map_err(|e| StoreError::Encryption(format!("Invalid key: {}", e)))?;

        // AEAD tag mismatch = wrong key or corrupted data
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| StoreError::Encryption("Decryption failed: wrong key or corrupted blob".to_string()))
    }
}
