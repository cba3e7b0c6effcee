//! Audio format detection from file extension and magic bytes.
//!
//! Sniffing reads only the leading bytes of the file - it never decodes
//! audio. The extension and the sniffed container must both resolve to a
//! format on the allow-list, and they must agree.

use std::path::Path;

/// Audio container formats the gateway admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    /// RIFF/WAVE container.
    Wav,
    /// MPEG audio (ID3-tagged or bare frame stream).
    Mp3,
    /// Free Lossless Audio Codec.
    Flac,
    /// MPEG-4 audio (ftyp brand M4A).
    M4a,
    /// Raw AAC (ADTS stream).
    Aac,
}

impl AudioFormat {
    /// Lowercase canonical extension for this format.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Flac => "flac",
            Self::M4a => "m4a",
            Self::Aac => "aac",
        }
    }

    /// MIME type reported in validation results.
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Wav => "audio/wav",
            Self::Mp3 => "audio/mpeg",
            Self::Flac => "audio/flac",
            Self::M4a => "audio/mp4",
            Self::Aac => "audio/aac",
        }
    }

    /// Resolve a format from a lowercase file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "wav" => Some(Self::Wav),
            "mp3" => Some(Self::Mp3),
            "flac" => Some(Self::Flac),
            "m4a" => Some(Self::M4a),
            "aac" => Some(Self::Aac),
            _ => None,
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Resolve the allow-listed format named by a path's extension, if any.
pub fn format_from_path(path: &Path) -> Option<AudioFormat> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    AudioFormat::from_extension(&ext)
}

/// Sniff the container format from the leading bytes of the file.
///
/// Returns `None` when the header matches no allow-listed format.
/// 16 bytes are enough for every signature checked here.
pub fn sniff_format(header: &[u8]) -> Option<AudioFormat> {
    // RIFF....WAVE
    if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WAVE" {
        return Some(AudioFormat::Wav);
    }

    // fLaC
    if header.starts_with(b"fLaC") {
        return Some(AudioFormat::Flac);
    }

    // ISO BMFF: size(4) + "ftyp" + brand(4). M4A brands start with "M4A "
    // or are generic mp4 audio brands.
    if header.len() >= 12 && &header[4..8] == b"ftyp" {
        let brand = &header[8..12];
        if brand == b"M4A " || brand == b"mp42" || brand == b"isom" {
            return Some(AudioFormat::M4a);
        }
        return None;
    }

    // ID3-tagged MPEG audio
    if header.starts_with(b"ID3") {
        return Some(AudioFormat::Mp3);
    }

    // Frame sync: 11 set bits. Distinguish ADTS AAC (layer bits 00) from
    // MPEG layer III (layer bits 01).
    if header.len() >= 2 && header[0] == 0xFF && (header[1] & 0xE0) == 0xE0 {
        let layer = (header[1] >> 1) & 0b11;
        return match layer {
            0b00 => Some(AudioFormat::Aac),
            0b01 => Some(AudioFormat::Mp3),
            _ => Some(AudioFormat::Mp3),
        };
    }

    None
}
