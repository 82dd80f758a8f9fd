//! AES-256-GCM encryption for secrets at rest.
//!
//! Each secret is encrypted separately with a fresh random nonce. The stored form is
//! self-describing: `base64(nonce):base64(ciphertext)`. The 256-bit key is derived once
//! from the configured master secret when the cipher is built.

use crate::config::Environment;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Separates the encoded nonce from the encoded ciphertext
const DELIMITER: char = ':';

/// Domain separation for key derivation
const KEY_CONTEXT: &[u8] = b"agentlink.secret-cipher.v1:";

/// Master secret shipped in sample configs. Never acceptable in production.
pub const INSECURE_DEFAULT_SECRET: &str = "default-encryption-key-change-me";

/// Cipher failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),
}

/// Symmetric cipher for credential secrets.
///
/// # Security
/// - Authenticated encryption (tampering detected)
/// - Nonce never reused (random per call)
/// - Key held in memory only, derived from the master secret
/// - Legacy plaintext values are still readable, see [`SecretCipher::decrypt`]
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// Builds a cipher from the master secret.
    ///
    /// Logs a critical error (but still succeeds) when the master secret is the known
    /// insecure default and `environment` is production.
    pub fn new(master_secret: &str, environment: Environment) -> Result<Self, CipherError> {
        if master_secret.is_empty() {
            return Err(CipherError::Encryption(
                "master secret must not be empty".to_string(),
            ));
        }

        if master_secret == INSECURE_DEFAULT_SECRET {
            if environment.is_production() {
                error!(
                    "CRITICAL: master encryption secret is the insecure default in production; \
                     stored credentials are effectively unprotected"
                );
            } else {
                warn!("Using the default master encryption secret (development only)");
            }
        }

        let key = Sha256::new()
            .chain_update(KEY_CONTEXT)
            .chain_update(master_secret.as_bytes())
            .finalize();

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CipherError::Encryption(format!("failed to create cipher: {}", e)))?;

        Ok(Self { cipher })
    }

    /// Encrypts a non-empty secret.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        if plaintext.is_empty() {
            return Err(CipherError::Encryption("plaintext is empty".to_string()));
        }

        // Generate random nonce (never reuse!)
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CipherError::Encryption(e.to_string()))?;

        Ok(format!(
            "{}{}{}",
            BASE64.encode(nonce),
            DELIMITER,
            BASE64.encode(ciphertext)
        ))
    }

    /// Decrypts a stored value.
    ///
    /// A value without the delimiter predates encryption and is returned unchanged via
    /// [`SecretCipher::read_legacy_plaintext`]. Anything carrying the delimiter must be a
    /// valid envelope or this fails.
    pub fn decrypt(&self, stored: &str) -> Result<String, CipherError> {
        match stored.split_once(DELIMITER) {
            Some((nonce_b64, ciphertext_b64)) => self.open(nonce_b64, ciphertext_b64),
            None => Ok(self.read_legacy_plaintext(stored)),
        }
    }

    /// Legacy read path for records written before encryption was introduced.
    ///
    /// Remove once every stored secret has been re-saved through [`SecretCipher::encrypt`].
    fn read_legacy_plaintext(&self, stored: &str) -> String {
        warn!("Read a legacy plaintext secret; re-save the record to encrypt it");
        stored.to_string()
    }

    fn open(&self, nonce_b64: &str, ciphertext_b64: &str) -> Result<String, CipherError> {
        let nonce_bytes = BASE64
            .decode(nonce_b64)
            .map_err(|e| CipherError::Decryption(format!("invalid nonce encoding: {}", e)))?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(CipherError::Decryption(format!(
                "invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            )));
        }

        let ciphertext = BASE64
            .decode(ciphertext_b64)
            .map_err(|e| CipherError::Decryption(format!("invalid ciphertext encoding: {}", e)))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| {
                CipherError::Decryption("wrong key or corrupted data".to_string())
            })?;

        String::from_utf8(plaintext)
            .map_err(|_| CipherError::Decryption("plaintext is not valid UTF-8".to_string()))
    }
}

/// True when a stored value would be read through the legacy plaintext path.
pub fn is_legacy_plaintext(stored: &str) -> bool {
    !stored.contains(DELIMITER)
}
