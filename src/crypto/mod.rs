//! Symmetric encryption for agent service tokens at rest.
//!
//! Ciphertext envelope is `base64(nonce || aes256gcm_ciphertext)`. The key is
//! either supplied directly (base64, 32 bytes) or derived from a secret and
//! salt via PBKDF2-HMAC-SHA256 with 100,000 iterations.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::Hmac;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const PBKDF2_ITERATIONS: u32 = 100_000;
const MIN_SALT_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum TokenCryptError {
    #[error("invalid token encryption configuration: `{0}`")]
    Config(String),
    #[error("failed to encrypt token")]
    Encrypt,
    #[error("failed to decrypt token: ciphertext invalid or key mismatch")]
    Decrypt,
    #[error("ciphertext is not valid base64")]
    Encoding(#[from] base64::DecodeError),
}

/// Source of the encryption key: either a literal key or a secret+salt pair
/// to derive one from. Constructed once at process startup; a missing or
/// malformed configuration is a fatal `Config` error, never silently
/// defaulted.
pub enum KeySource {
    Direct { key_b64: String },
    Derived { secret: String, salt: String },
}

pub struct TokenCrypt {
    key: [u8; KEY_LEN],
}

impl TokenCrypt {
    pub fn new(source: KeySource) -> Result<Self, TokenCryptError> {
        let key = match source {
            KeySource::Direct { key_b64 } => {
                let bytes = BASE64
                    .decode(key_b64.trim())
                    .map_err(|e| TokenCryptError::Config(format!("invalid encryption key: {e}")))?;
                if bytes.len() != KEY_LEN {
                    return Err(TokenCryptError::Config(format!(
                        "encryption key must decode to {KEY_LEN} bytes, got {}",
                        bytes.len()
                    )));
                }
                let mut key = [0u8; KEY_LEN];
                key.copy_from_slice(&bytes);
                key
            }
            KeySource::Derived { secret, salt } => {
                if secret.is_empty() {
                    return Err(TokenCryptError::Config(
                        "secret must not be empty".to_string(),
                    ));
                }
                if salt.len() < MIN_SALT_LEN {
                    return Err(TokenCryptError::Config(format!(
                        "salt must be at least {MIN_SALT_LEN} bytes"
                    )));
                }
                let mut key = [0u8; KEY_LEN];
                pbkdf2::pbkdf2::<Hmac<Sha256>>(
                    secret.as_bytes(),
                    salt.as_bytes(),
                    PBKDF2_ITERATIONS,
                    &mut key,
                )
                .map_err(|e| TokenCryptError::Config(format!("key derivation failed: {e}")))?;
                key
            }
        };
        Ok(Self { key })
    }

    pub fn encrypt_token(&self, token: &str) -> Result<String, TokenCryptError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, token.as_bytes())
            .map_err(|_| TokenCryptError::Encrypt)?;
        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(envelope))
    }

    pub fn decrypt_token(&self, encrypted: &str) -> Result<String, TokenCryptError> {
        let envelope = BASE64.decode(encrypted.trim())?;
        if envelope.len() < NONCE_LEN {
            return Err(TokenCryptError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| TokenCryptError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| TokenCryptError::Decrypt)
    }
}
