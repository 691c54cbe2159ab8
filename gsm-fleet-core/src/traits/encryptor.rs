/// Streaming encryption for recorded call audio.
///
/// Encrypted chunk format:
/// ```text
/// [12-byte nonce] [ciphertext] [16-byte GCM authentication tag]
/// ```
pub trait RecordingEncryptor: Send + Sync {
    /// Returns `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, String>;

    /// Identifier of the key, recorded in metadata.
    fn key_id(&self) -> String;

    fn algorithm(&self) -> &str;

    fn clone_box(&self) -> Box<dyn RecordingEncryptor>;
}

impl Clone for Box<dyn RecordingEncryptor> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}
