use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key};
use sha2::{Digest, Sha256};

use super::wav_writer::hex_encode;
use crate::traits::encryptor::RecordingEncryptor;

/// AES-256-GCM recording encryptor keyed from configuration.
///
/// Chunk format: `nonce (12B) || ciphertext || tag (16B)`.
#[derive(Clone)]
pub struct Aes256GcmEncryptor {
    cipher: Aes256Gcm,
    key_id: String,
}

impl Aes256GcmEncryptor {
    pub fn new(key: &[u8; 32]) -> Self {
        let key_id = hex_encode(&Sha256::digest(key)[..8]);
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            key_id,
        }
    }

    /// Build from 64 hex characters.
    pub fn from_hex(hex: &str) -> Result<Self, String> {
        let hex = hex.trim();
        if hex.len() != 64 {
            return Err(format!("expected 64 hex characters, got {}", hex.len()));
        }
        if let Some(pos) = hex.bytes().position(|b| !b.is_ascii_hexdigit()) {
            return Err(format!("invalid key hex at byte {}", pos));
        }
        let mut key = [0u8; 32];
        for (pair, byte) in hex.as_bytes().chunks(2).zip(key.iter_mut()) {
            *byte = (hex_value(pair[0]) << 4) | hex_value(pair[1]);
        }
        Ok(Self::new(&key))
    }
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

impl RecordingEncryptor for Aes256GcmEncryptor {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, data)
            .map_err(|e| format!("AES-GCM encryption failed: {}", e))?;

        let mut sealed = Vec::with_capacity(nonce.len() + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn key_id(&self) -> String {
        self.key_id.clone()
    }

    fn algorithm(&self) -> &str {
        "AES-256-GCM"
    }

    fn clone_box(&self) -> Box<dyn RecordingEncryptor> {
        Box::new(self.clone())
    }
}
