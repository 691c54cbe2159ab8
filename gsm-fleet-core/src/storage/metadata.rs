use std::fs;
use std::path::{Path, PathBuf};

use crate::models::error::RecordingError;
use crate::models::recording_result::RecordingMetadata;

/// Sidecar path for a recording: `call_x.wav` → `call_x.metadata.json`,
/// `call_x.enc.wav` → `call_x.enc.metadata.json`.
pub fn metadata_path(recording_path: &Path) -> PathBuf {
    recording_path.with_extension("metadata.json")
}

/// Write recording metadata as a pretty-printed JSON sidecar.
pub fn write_metadata(metadata: &RecordingMetadata, recording_path: &Path) -> Result<PathBuf, RecordingError> {
    let path = metadata_path(recording_path);
    let json = serde_json::to_string_pretty(metadata)
        .map_err(|e| RecordingError::StorageError(format!("failed to serialize metadata: {}", e)))?;
    fs::write(&path, json)
        .map_err(|e| RecordingError::StorageError(format!("failed to write {}: {}", path.display(), e)))?;
    Ok(path)
}

pub fn read_metadata(recording_path: &Path) -> Result<RecordingMetadata, RecordingError> {
    let path = metadata_path(recording_path);
    let json = fs::read_to_string(&path)
        .map_err(|e| RecordingError::StorageError(format!("failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&json)
        .map_err(|e| RecordingError::StorageError(format!("failed to parse {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audio::PcmFormat;

    #[test]
    fn sidecar_next_to_recording() {
        assert_eq!(
            metadata_path(Path::new("/rec/call_1.wav")),
            PathBuf::from("/rec/call_1.metadata.json")
        );
    }

    #[test]
    fn metadata_survives_disk() {
        let dir = std::env::temp_dir().join(format!("gsm_fleet_meta_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let recording = dir.join("call_abc.wav");

        let metadata = RecordingMetadata::new(
            "call_abc",
            "m1",
            9.98,
            &recording.to_string_lossy(),
            "deadbeef",
            PcmFormat::mono(8000),
            0,
            None,
            None,
        );
        let written = write_metadata(&metadata, &recording).unwrap();
        assert!(written.ends_with("call_abc.metadata.json"));

        let loaded = read_metadata(&recording).unwrap();
        assert_eq!(loaded, metadata);
        assert!(!loaded.is_encrypted);

        fs::remove_dir_all(&dir).ok();
    }
}
