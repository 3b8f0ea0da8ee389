use crate::error::{ConfigError, SinkError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use std::path::Path;
use zeroize::Zeroizing;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 encryption directive.
///
/// Output is `base64(nonce || ciphertext)` so it can stand in for the token bytes.
#[derive(Clone)]
pub struct Encryptor {
    cipher: ChaCha20Poly1305,
    aad: Vec<u8>,
}

impl Encryptor {
    pub fn new(key: &[u8; KEY_LEN], aad: Option<String>) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            aad: aad.map(String::into_bytes).unwrap_or_default(),
        }
    }

    /// Reads a key file holding either 32 raw bytes or 64 hex characters.
    pub fn from_key_file(path: &Path, aad: Option<String>) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::Sink {
            sink: "encrypt".into(),
            message,
        };

        let raw = Zeroizing::new(std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?);

        let key: Zeroizing<Vec<u8>> = if raw.len() == KEY_LEN {
            raw
        } else {
            let text = String::from_utf8_lossy(&raw);
            let decoded = hex::decode(text.trim())
                .map_err(|e| invalid(format!("{} is not a hex key: {}", path.display(), e)))?;
            Zeroizing::new(decoded)
        };

        let key: &[u8; KEY_LEN] = key.as_slice().try_into().map_err(|_| {
            invalid(format!(
                "{} must hold a {}-byte key, got {} bytes",
                path.display(),
                KEY_LEN,
                key.len()
            ))
        })?;
        Ok(Self::new(key, aad))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, SinkError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &self.aad,
                },
            )
            .map_err(|e| SinkError::Encrypt(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, SinkError> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| SinkError::Encrypt(e.to_string()))?;
        if bytes.len() < NONCE_LEN {
            return Err(SinkError::Encrypt("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &self.aad,
                },
            )
            .map_err(|e| SinkError::Encrypt(e.to_string()))
    }
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor").finish_non_exhaustive()
    }
}
