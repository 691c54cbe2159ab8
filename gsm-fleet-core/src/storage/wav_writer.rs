use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::audio::wav_format::{self, WAV_HEADER_SIZE};
use crate::models::audio::PcmFormat;
use crate::models::error::RecordingError;
use crate::traits::encryptor::RecordingEncryptor;

/// Writes a call recording as WAV, optionally encrypting the payload.
///
/// **Plain:**
/// ```text
/// [44-byte header][16-bit LE PCM ...]
/// ```
///
/// **Encrypted:**
/// ```text
/// [44-byte header, unencrypted]
/// [4-byte LE length | nonce + ciphertext + tag]
/// [4-byte LE length | ...]
/// ```
///
/// The header's size fields describe the payload as stored on disk.
pub struct WavFileWriter {
    path: PathBuf,
    format: PcmFormat,
    encryptor: Option<Box<dyn RecordingEncryptor>>,
    file: Option<BufWriter<File>>,
    payload_bytes: u64,
    pcm_bytes: u64,
}

impl WavFileWriter {
    /// Create the file (and its directory) and reserve the header.
    pub fn create(
        path: PathBuf,
        format: PcmFormat,
        encryptor: Option<Box<dyn RecordingEncryptor>>,
    ) -> Result<Self, RecordingError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                RecordingError::StorageError(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        let file = File::create(&path)
            .map_err(|e| RecordingError::StorageError(format!("failed to create {}: {}", path.display(), e)))?;

        let mut writer = Self {
            path,
            format,
            encryptor,
            file: Some(BufWriter::new(file)),
            payload_bytes: 0,
            pcm_bytes: 0,
        };
        writer.write_raw(&wav_format::wav_header(format, 0))?;
        Ok(writer)
    }

    /// Append interleaved samples. With an encryptor each call is one chunk.
    pub fn write_samples(&mut self, samples: &[i16]) -> Result<(), RecordingError> {
        if samples.is_empty() {
            return Ok(());
        }
        let pcm = wav_format::samples_to_le_bytes(samples);
        self.pcm_bytes += pcm.len() as u64;

        let sealed = match self.encryptor {
            Some(ref encryptor) => Some(
                encryptor
                    .encrypt(&pcm)
                    .map_err(RecordingError::EncryptionFailed)?,
            ),
            None => None,
        };
        match sealed {
            Some(chunk) => {
                self.write_payload(&(chunk.len() as u32).to_le_bytes())?;
                self.write_payload(&chunk)
            }
            None => self.write_payload(&pcm),
        }
    }

    /// Patch the header sizes, flush, and return the file's SHA-256 (hex).
    pub fn finish(mut self) -> Result<String, RecordingError> {
        let buffered = self
            .file
            .take()
            .ok_or_else(|| RecordingError::StorageError("writer already finished".into()))?;
        let mut file = buffered
            .into_inner()
            .map_err(|e| RecordingError::StorageError(format!("flush failed: {}", e.error())))?;

        let data_size = u32::try_from(self.payload_bytes)
            .map_err(|_| RecordingError::StorageError("recording exceeds WAV size limit".into()))?;
        let header = wav_format::wav_header(self.format, data_size);
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&header))
            .and_then(|()| file.sync_all())
            .map_err(|e| RecordingError::StorageError(format!("failed to finalize header: {}", e)))?;
        drop(file);

        sha256_file(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryptor.is_some()
    }

    /// Plain PCM bytes written so far, before encryption.
    pub fn pcm_bytes(&self) -> u64 {
        self.pcm_bytes
    }

    fn write_payload(&mut self, bytes: &[u8]) -> Result<(), RecordingError> {
        self.write_raw(bytes)?;
        self.payload_bytes += bytes.len() as u64;
        Ok(())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), RecordingError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| RecordingError::StorageError("writer already finished".into()))?;
        file.write_all(bytes)
            .map_err(|e| RecordingError::StorageError(format!("write failed: {}", e)))
    }
}

/// SHA-256 hex digest of a file.
pub fn sha256_file(path: &Path) -> Result<String, RecordingError> {
    let data = fs::read(path)
        .map_err(|e| RecordingError::StorageError(format!("failed to read {} for checksum: {}", path.display(), e)))?;
    Ok(hex_encode(&Sha256::digest(&data)))
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
