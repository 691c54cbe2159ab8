use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::audio::PcmFormat;

/// Result returned when a call recording has been finalized.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingResult {
    pub file_path: PathBuf,
    pub duration_secs: f64,
    pub metadata: RecordingMetadata,
    pub checksum: String,
}

/// Metadata stored alongside a recording as a JSON sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingMetadata {
    pub id: String,
    pub call_id: String,
    pub module_id: String,
    pub duration_secs: f64,
    pub file_path: String,
    pub checksum: String,
    pub created_at: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub samples_dropped: u64,
    pub is_encrypted: bool,
    pub encryption_algorithm: Option<String>,
    pub encryption_key_id: Option<String>,
}

impl RecordingMetadata {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call_id: &str,
        module_id: &str,
        duration_secs: f64,
        file_path: &str,
        checksum: &str,
        format: PcmFormat,
        samples_dropped: u64,
        encryption_algorithm: Option<String>,
        encryption_key_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            call_id: call_id.to_string(),
            module_id: module_id.to_string(),
            duration_secs,
            file_path: file_path.to_string(),
            checksum: checksum.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            sample_rate: format.sample_rate,
            channels: format.channels,
            bit_depth: PcmFormat::BIT_DEPTH,
            samples_dropped,
            is_encrypted: encryption_algorithm.is_some(),
            encryption_algorithm,
            encryption_key_id,
        }
    }
}
