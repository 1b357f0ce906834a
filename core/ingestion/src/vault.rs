//! AES-256-GCM encryption for OMI API keys at rest.
//!
//! Stored format: `base64(nonce (12 bytes) || ciphertext)`.
//!
//! Errors never carry plaintext or key material.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

const NONCE_SIZE: usize = 12;

pub const OMI_KEY_PREFIX: &str = "omi_";
pub const OMI_KEY_MIN_LEN: usize = 20;
pub const OMI_KEY_MAX_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid ciphertext: too short")]
    CiphertextTooShort,

    #[error("invalid base64 encoding")]
    InvalidEncoding,

    #[error("encryption key must be 32 bytes of base64")]
    InvalidKey,
}

pub struct KeyVault {
    cipher: Aes256Gcm,
}

impl KeyVault {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Key supplied as base64 (e.g. `JARVIS_ENCRYPTION_KEY`)
    pub fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| VaultError::InvalidKey)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| VaultError::InvalidKey)?;
        Ok(Self::new(&key))
    }

    /// Random per-process key. Anything encrypted with it is unreadable
    /// after a restart.
    pub fn ephemeral() -> Self {
        Self::new(&random_bytes::<32>())
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, VaultError> {
        let sealed = STANDARD
            .decode(encoded)
            .map_err(|_| VaultError::InvalidEncoding)?;
        if sealed.len() < NONCE_SIZE {
            return Err(VaultError::CiphertextTooShort);
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| VaultError::DecryptionFailed)
    }
}

/// Fill an array from the OS CSPRNG
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use aes_gcm::aead::rand_core::RngCore;
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Shape check for an OMI developer key
pub fn validate_omi_key(key: &str) -> Result<(), String> {
    let len = key.chars().count();
    if !key.starts_with(OMI_KEY_PREFIX) {
        return Err(format!("key must start with '{}'", OMI_KEY_PREFIX));
    }
    if !(OMI_KEY_MIN_LEN..=OMI_KEY_MAX_LEN).contains(&len) {
        return Err(format!(
            "key must be between {} and {} characters",
            OMI_KEY_MIN_LEN, OMI_KEY_MAX_LEN
        ));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err("key contains invalid characters".to_string());
    }
    Ok(())
}

/// Last four characters, everything else masked
pub fn key_preview(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let visible: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("****{}", visible)
}
