//! Authenticated encryption of deployment credentials.
//!
//! Uses AES-256-GCM with a random 96-bit nonce per call. Tokens are stored as
//! three hex segments:
//!
//! ```text
//! nonce (12 bytes) : tag (16 bytes) : ciphertext
//! ```

use aes_gcm::{
    aead::{Aead, AeadCore, OsRng},
    Aes256Gcm, Key, KeyInit, Nonce,
};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the GCM nonce in bytes.
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag.
const TAG_SIZE: usize = 16;

/// Errors from the secrets codec
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretsError {
    /// Authentication tag did not verify: tampering or wrong master key
    #[error("integrity check failed for sealed secret")]
    Integrity,

    /// Token is not `nonce:tag:ciphertext` in hex
    #[error("malformed sealed secret: {0}")]
    Format(String),

    #[error("invalid master key: {0}")]
    InvalidMasterKey(String),

    #[error("encryption failed: {0}")]
    Encryption(String),
}

/// Symmetric codec holding the process master key.
pub struct SecretsCodec {
    key: Key<Aes256Gcm>,
}

impl SecretsCodec {
    /// Build a codec from a 64-character hex master key.
    pub fn new(master_key: &SecretString) -> Result<Self, SecretsError> {
        let bytes = hex::decode(master_key.expose_secret().trim())
            .map_err(|_| SecretsError::InvalidMasterKey("expected hex".to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Build a codec from raw key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SecretsError> {
        if bytes.len() != KEY_SIZE {
            return Err(SecretsError::InvalidMasterKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        Ok(Self {
            key: *Key::<Aes256Gcm>::from_slice(bytes),
        })
    }

    /// Generate a fresh hex master key.
    pub fn generate_master_key() -> SecretString {
        let key = Aes256Gcm::generate_key(OsRng);
        SecretString::from(hex::encode(key))
    }

    /// Encrypt `plaintext` into a `nonce:tag:ciphertext` token.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretsError> {
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        // aes-gcm appends the tag to the ciphertext
        let mut sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| SecretsError::Encryption(e.to_string()))?;
        let tag = sealed.split_off(sealed.len() - TAG_SIZE);

        Ok(format!(
            "{}:{}:{}",
            hex::encode(nonce),
            hex::encode(tag),
            hex::encode(sealed)
        ))
    }

    /// Decrypt a token produced by [`SecretsCodec::encrypt`].
    pub fn decrypt(&self, token: &str) -> Result<String, SecretsError> {
        let (nonce, tag, ciphertext) = parse_token(token)
            .ok_or_else(|| SecretsError::Format("expected three hex segments".to_string()))?;

        if nonce.len() != NONCE_SIZE {
            return Err(SecretsError::Format(format!(
                "nonce must be {} bytes, got {}",
                NONCE_SIZE,
                nonce.len()
            )));
        }
        if tag.len() != TAG_SIZE {
            return Err(SecretsError::Format(format!(
                "tag must be {} bytes, got {}",
                TAG_SIZE,
                tag.len()
            )));
        }

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new(&self.key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
            .map_err(|_| SecretsError::Integrity)?;

        String::from_utf8(plaintext)
            .map_err(|_| SecretsError::Format("plaintext is not UTF-8".to_string()))
    }
}

impl std::fmt::Debug for SecretsCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsCodec")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Whether `value` has the shape of a sealed token.
///
/// Anything else is legacy plaintext.
pub fn is_sealed(value: &str) -> bool {
    parse_token(value).is_some()
}

fn parse_token(token: &str) -> Option<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let mut parts = token.split(':');
    let (nonce, tag, ciphertext) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || nonce.is_empty() || tag.is_empty() {
        return None;
    }
    Some((
        hex::decode(nonce).ok()?,
        hex::decode(tag).ok()?,
        hex::decode(ciphertext).ok()?,
    ))
}
