//! RIFF/WAVE header handling for 16-bit PCM call recordings.

use crate::models::audio::PcmFormat;

/// Size of the canonical PCM header in bytes.
pub const WAV_HEADER_SIZE: usize = 44;

/// Build a 44-byte PCM header.
///
/// ```text
/// [0-3]    "RIFF"
/// [4-7]    36 + data_size
/// [8-11]   "WAVE"
/// [12-15]  "fmt "
/// [16-19]  16
/// [20-21]  1 (PCM)
/// [22-23]  channels
/// [24-27]  sample_rate
/// [28-31]  byte_rate
/// [32-33]  block_align
/// [34-35]  16
/// [36-39]  "data"
/// [40-43]  data_size
/// ```
pub fn wav_header(format: PcmFormat, data_size: u32) -> [u8; WAV_HEADER_SIZE] {
    let block_align = format.channels * (PcmFormat::BIT_DEPTH / 8);
    let byte_rate = format.sample_rate * block_align as u32;

    let mut header = [0u8; WAV_HEADER_SIZE];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&(36u32.saturating_add(data_size)).to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes());
    header[22..24].copy_from_slice(&format.channels.to_le_bytes());
    header[24..28].copy_from_slice(&format.sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&PcmFormat::BIT_DEPTH.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_size.to_le_bytes());
    header
}

/// Parsed fields of a canonical PCM header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    pub format: PcmFormat,
    pub bit_depth: u16,
    pub data_size: u32,
}

/// Read back a header written by [`wav_header`]. Returns `None` for anything
/// that is not a canonical 44-byte PCM header.
pub fn parse_header(bytes: &[u8]) -> Option<WavInfo> {
    if bytes.len() < WAV_HEADER_SIZE
        || &bytes[0..4] != b"RIFF"
        || &bytes[8..12] != b"WAVE"
        || &bytes[12..16] != b"fmt "
        || &bytes[36..40] != b"data"
    {
        return None;
    }
    let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
    let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

    if u16_at(20) != 1 {
        return None;
    }
    Some(WavInfo {
        format: PcmFormat {
            sample_rate: u32_at(24),
            channels: u16_at(22),
        },
        bit_depth: u16_at(34),
        data_size: u32_at(40),
    })
}

/// Interleaved samples as little-endian bytes.
pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_for_8k_mono() {
        let header = wav_header(PcmFormat::mono(8000), 16000);

        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[8..12], b"WAVE");
        assert_eq!(&header[36..40], b"data");

        let byte_rate = u32::from_le_bytes([header[28], header[29], header[30], header[31]]);
        assert_eq!(byte_rate, 16000);
        let block_align = u16::from_le_bytes([header[32], header[33]]);
        assert_eq!(block_align, 2);
        let chunk_size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        assert_eq!(chunk_size, 36 + 16000);
    }

    #[test]
    fn header_parses_back() {
        let format = PcmFormat {
            sample_rate: 16000,
            channels: 2,
        };
        let info = parse_header(&wav_header(format, 640)).unwrap();
        assert_eq!(info.format, format);
        assert_eq!(info.bit_depth, 16);
        assert_eq!(info.data_size, 640);
    }

    #[test]
    fn rejects_non_wav_bytes() {
        assert!(parse_header(b"not a wav file at all, definitely not 44 bytes").is_none());
        assert!(parse_header(&[0u8; 10]).is_none());
    }

    #[test]
    fn samples_are_little_endian() {
        assert_eq!(samples_to_le_bytes(&[1, -2]), vec![0x01, 0x00, 0xFE, 0xFF]);
    }
}
