//! Audio container detection for uploaded payloads.
//!
//! Header-only sniffing: only the leading bytes of the payload are inspected,
//! nothing is decoded. The normalization tool does the real parsing later;
//! this check exists so obviously wrong uploads never become jobs.

use serde::Serialize;

use crate::error::CoreError;

/// Audio containers accepted for normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioContainer {
    Wav,
    Aiff,
    Mp3,
    Aac,
    Flac,
    Ogg,
    Mp4,
    Matroska,
}

impl AudioContainer {
    /// File extension used when the payload is written to disk.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Aiff => "aiff",
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::Flac => "flac",
            Self::Ogg => "ogg",
            Self::Mp4 => "m4a",
            Self::Matroska => "mka",
        }
    }

    /// Stable lowercase name persisted with the job.
    pub fn name(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Aiff => "aiff",
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::Flac => "flac",
            Self::Ogg => "ogg",
            Self::Mp4 => "mp4",
            Self::Matroska => "matroska",
        }
    }
}

/// Identify the container from the payload's magic bytes.
pub fn detect_container(bytes: &[u8]) -> Option<AudioContainer> {
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        return Some(AudioContainer::Wav);
    }
    if bytes.len() >= 12
        && &bytes[0..4] == b"FORM"
        && (&bytes[8..12] == b"AIFF" || &bytes[8..12] == b"AIFC")
    {
        return Some(AudioContainer::Aiff);
    }
    if bytes.starts_with(b"fLaC") {
        return Some(AudioContainer::Flac);
    }
    if bytes.starts_with(b"OggS") {
        return Some(AudioContainer::Ogg);
    }
    if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some(AudioContainer::Matroska);
    }
    if bytes.len() >= 8 && &bytes[4..8] == b"ftyp" {
        return Some(AudioContainer::Mp4);
    }
    if bytes.starts_with(b"ID3") {
        return Some(AudioContainer::Mp3);
    }
    // MPEG audio frame sync: 11 set bits. Layer bits `00` mean ADTS AAC.
    if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0 {
        return if bytes[1] & 0x06 == 0 {
            Some(AudioContainer::Aac)
        } else {
            Some(AudioContainer::Mp3)
        };
    }
    None
}

/// Validate an uploaded payload before any job is created.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `max_bytes`.
/// - Must start with the signature of a recognized audio container.
pub fn validate_upload(bytes: &[u8], max_bytes: usize) -> Result<AudioContainer, CoreError> {
    if bytes.is_empty() {
        return Err(CoreError::Validation(
            "Audio payload must not be empty".to_string(),
        ));
    }
    if bytes.len() > max_bytes {
        return Err(CoreError::Validation(format!(
            "Audio payload must not exceed {max_bytes} bytes"
        )));
    }
    detect_container(bytes).ok_or_else(|| {
        CoreError::Validation("Payload is not a recognized audio container".to_string())
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn wav_header() -> Vec<u8> {
        let mut bytes = b"RIFF".to_vec();
        bytes.extend_from_slice(&36u32.to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes
    }

    #[test]
    fn detects_wav() {
        assert_eq!(detect_container(&wav_header()), Some(AudioContainer::Wav));
    }

    #[test]
    fn riff_without_wave_is_rejected() {
        let mut bytes = wav_header();
        bytes[8..12].copy_from_slice(b"AVI ");
        assert_eq!(detect_container(&bytes), None);
    }

    #[test]
    fn detects_mp3_with_id3_tag() {
        assert_eq!(detect_container(b"ID3\x04\x00\x00"), Some(AudioContainer::Mp3));
    }

    #[test]
    fn detects_bare_mp3_frame() {
        assert_eq!(detect_container(&[0xFF, 0xFB, 0x90, 0x64]), Some(AudioContainer::Mp3));
    }

    #[test]
    fn detects_adts_aac() {
        assert_eq!(detect_container(&[0xFF, 0xF1, 0x50, 0x80]), Some(AudioContainer::Aac));
    }

    #[test]
    fn detects_flac_ogg_and_matroska() {
        assert_eq!(detect_container(b"fLaC\x00\x00"), Some(AudioContainer::Flac));
        assert_eq!(detect_container(b"OggS\x00\x02"), Some(AudioContainer::Ogg));
        assert_eq!(
            detect_container(&[0x1A, 0x45, 0xDF, 0xA3, 0x01]),
            Some(AudioContainer::Matroska)
        );
    }

    #[test]
    fn detects_mp4_by_ftyp_box() {
        assert_eq!(
            detect_container(b"\x00\x00\x00\x20ftypM4A "),
            Some(AudioContainer::Mp4)
        );
    }

    #[test]
    fn detects_aiff() {
        assert_eq!(
            detect_container(b"FORM\x00\x00\x10\x00AIFFCOMM"),
            Some(AudioContainer::Aiff)
        );
    }

    #[test]
    fn text_is_not_audio() {
        assert_eq!(detect_container(b"hello world, not audio"), None);
    }

    #[test]
    fn empty_payload_fails_validation() {
        assert_matches!(validate_upload(&[], 1024), Err(CoreError::Validation(_)));
    }

    #[test]
    fn oversized_payload_fails_validation() {
        let bytes = wav_header();
        assert_matches!(validate_upload(&bytes, 4), Err(CoreError::Validation(_)));
    }

    #[test]
    fn unrecognized_payload_fails_validation() {
        assert_matches!(
            validate_upload(b"<html></html>", 1024),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn valid_payload_returns_container() {
        assert_eq!(
            validate_upload(&wav_header(), 1024).unwrap(),
            AudioContainer::Wav
        );
    }

    #[test]
    fn extension_and_name_differ_for_mp4() {
        assert_eq!(AudioContainer::Mp4.extension(), "m4a");
        assert_eq!(AudioContainer::Mp4.name(), "mp4");
    }
}
