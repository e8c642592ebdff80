//! # Upload Validation
//!
//! Decides whether an uploaded payload is something the decoder should even
//! try. Detection looks at the leading bytes first and only falls back to
//! the file name to pick the error kind:
//!
//! | signature            | extension       | outcome            |
//! |----------------------|-----------------|--------------------|
//! | allow-listed         | anything        | accepted           |
//! | unrecognised         | allow-listed    | `InvalidFormat`    |
//! | unrecognised         | other / missing | `UnsupportedCodec` |
//!
//! Recognised payloads the decoder has no codec for (ASF/WMA, AVI, Opus in
//! Ogg or Matroska) fail as `UnsupportedCodec` before any model is touched.
//!
//! Validation never transcodes. Whether the bytes really decode is the
//! decoder's problem and fails as `DecodeFailure`.

use crate::error::{CoreResult, TranscriptionError};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use serde::Serialize;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, warn};

/// Containers accepted for transcription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    Flac,
    Ogg,
    /// ISO base media (M4A, MP4, MOV)
    Mp4,
    /// Raw AAC in ADTS framing
    Aac,
    /// Matroska with a Vorbis, FLAC, PCM, AAC or MP3 track
    Mkv,
}

const ASF_GUID: [u8; 8] = [0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11];
const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// How far into a Matroska file to look for the track codec id.
const MKV_SCAN_BYTES: usize = 64 * 1024;

impl AudioFormat {
    /// Identify a container from its leading bytes.
    pub fn sniff(data: &[u8]) -> Option<AudioFormat> {
        if data.len() >= 12 && &data[0..4] == b"RIFF" {
            return match &data[8..12] {
                b"WAVE" => Some(AudioFormat::Wav),
                _ => None,
            };
        }
        if data.starts_with(b"fLaC") {
            return Some(AudioFormat::Flac);
        }
        if data.starts_with(b"OggS") {
            return Some(AudioFormat::Ogg);
        }
        if data.starts_with(b"ID3") {
            return Some(AudioFormat::Mp3);
        }
        if data.len() >= 8 && &data[4..8] == b"ftyp" {
            return Some(AudioFormat::Mp4);
        }
        if data.starts_with(&EBML_MAGIC) {
            return Some(AudioFormat::Mkv);
        }
        if data.len() >= 2 && data[0] == 0xFF {
            // ADTS: 12 sync bits, layer bits always 00
            if data[1] & 0xF6 == 0xF0 {
                return Some(AudioFormat::Aac);
            }
            // MPEG audio frame sync: 11 sync bits, layer bits non-zero
            if data[1] & 0xE0 == 0xE0 && data[1] & 0x06 != 0 {
                return Some(AudioFormat::Mp3);
            }
        }
        None
    }

    /// Map a file extension (without the dot) onto a container.
    pub fn from_extension(ext: &str) -> Option<AudioFormat> {
        match ext.to_lowercase().as_str() {
            "wav" | "wave" => Some(AudioFormat::Wav),
            "mp3" => Some(AudioFormat::Mp3),
            "flac" => Some(AudioFormat::Flac),
            "ogg" | "oga" => Some(AudioFormat::Ogg),
            "m4a" | "mp4" | "mov" => Some(AudioFormat::Mp4),
            "aac" => Some(AudioFormat::Aac),
            "mkv" | "mka" => Some(AudioFormat::Mkv),
            _ => None,
        }
    }

    /// Extension handed to the demuxer as a probe hint.
    pub fn hint_extension(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Flac => "flac",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Mp4 => "mp4",
            AudioFormat::Aac => "aac",
            AudioFormat::Mkv => "mkv",
        }
    }
}

/// Extensions listed to clients as supported.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    ".mp3", ".wav", ".m4a", ".flac", ".ogg", ".aac", ".mp4", ".mov", ".mkv",
];

/// Name the codec of a recognisable payload that cannot be decoded here.
fn undecodable(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(&ASF_GUID) {
        return Some("Windows Media (ASF)");
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"AVI " {
        return Some("AVI");
    }
    if data.starts_with(b"OggS") {
        // first packet of the first page identifies the codec
        let payload = data
            .get(26)
            .map(|segments| 27 + *segments as usize)
            .and_then(|start| data.get(start..));
        return match payload {
            Some(p) if p.starts_with(b"\x01vorbis") || p.starts_with(b"\x7FFLAC") => None,
            Some(p) if p.starts_with(b"OpusHead") => Some("Opus"),
            Some(p) if p.starts_with(b"Speex") => Some("Speex"),
            _ => Some("an unknown Ogg codec"),
        };
    }
    if data.starts_with(&EBML_MAGIC) {
        let head = &data[..data.len().min(MKV_SCAN_BYTES)];
        if head.windows(6).any(|w| w == b"A_OPUS") {
            return Some("Opus");
        }
    }
    None
}

/// A payload that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedAudio {
    pub bytes: Bytes,
    pub format: AudioFormat,
    pub file_name: String,
}

/// Stateless upload checker.
#[derive(Debug, Clone)]
pub struct FileValidator {
    max_size_bytes: usize,
}

impl FileValidator {
    pub fn new(max_size_bytes: usize) -> Self {
        Self { max_size_bytes }
    }

    pub fn validate(&self, file_name: &str, bytes: Bytes) -> CoreResult<ValidatedAudio> {
        if bytes.is_empty() {
            return Err(TranscriptionError::EmptyPayload);
        }

        if bytes.len() > self.max_size_bytes {
            return Err(TranscriptionError::InvalidFormat(format!(
                "file is {} bytes, the limit is {} bytes",
                bytes.len(),
                self.max_size_bytes
            )));
        }

        if let Some(codec) = undecodable(&bytes) {
            return Err(TranscriptionError::UnsupportedCodec(format!(
                "'{}' contains {} audio, which cannot be decoded",
                file_name, codec
            )));
        }

        let extension = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        let declared = AudioFormat::from_extension(extension);

        let format = match (AudioFormat::sniff(&bytes), declared) {
            (Some(sniffed), declared) => {
                if declared.is_some_and(|d| d != sniffed) {
                    warn!(
                        file_name = %file_name,
                        sniffed = ?sniffed,
                        "File extension does not match its content, using the sniffed format"
                    );
                }
                sniffed
            }
            (None, Some(declared)) => {
                return Err(TranscriptionError::InvalidFormat(format!(
                    "'{}' does not look like a {:?} file",
                    file_name, declared
                )));
            }
            (None, None) => {
                let shown = if extension.is_empty() {
                    "files without an extension".to_string()
                } else {
                    format!("'.{}'", extension)
                };
                return Err(TranscriptionError::UnsupportedCodec(format!(
                    "{} is not an accepted audio or video container",
                    shown
                )));
            }
        };

        if format == AudioFormat::Wav {
            check_wav_header(&bytes)?;
        }

        debug!(file_name = %file_name, format = ?format, size = bytes.len(), "Upload validated");

        Ok(ValidatedAudio {
            bytes,
            format,
            file_name: file_name.to_string(),
        })
    }
}

/// Walk the RIFF chunks until `fmt ` and check channel count and sample rate.
fn check_wav_header(data: &[u8]) -> CoreResult<()> {
    let invalid = |msg: &str| TranscriptionError::InvalidFormat(format!("WAV header: {}", msg));

    let mut cursor = Cursor::new(data);
    cursor
        .seek(SeekFrom::Start(12))
        .map_err(|_| invalid("truncated"))?;

    loop {
        let mut id = [0u8; 4];
        if cursor.read_exact(&mut id).is_err() {
            return Err(invalid("missing 'fmt ' chunk"));
        }
        let size = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| invalid("truncated chunk header"))?;

        if &id == b"fmt " {
            if size < 16 {
                return Err(invalid("'fmt ' chunk too short"));
            }
            let _format_tag = cursor
                .read_u16::<LittleEndian>()
                .map_err(|_| invalid("truncated 'fmt ' chunk"))?;
            let channels = cursor
                .read_u16::<LittleEndian>()
                .map_err(|_| invalid("truncated 'fmt ' chunk"))?;
            let sample_rate = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| invalid("truncated 'fmt ' chunk"))?;

            if channels == 0 {
                return Err(invalid("zero channels"));
            }
            if sample_rate == 0 {
                return Err(invalid("zero sample rate"));
            }
            return Ok(());
        }

        // chunks are word aligned
        let skip = size as i64 + (size & 1) as i64;
        cursor
            .seek(SeekFrom::Current(skip))
            .map_err(|_| invalid("truncated chunk"))?;
    }
}

/// Encode 16-bit PCM as a canonical WAV file.
#[cfg(test)]
pub(crate) fn encode_wav(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    use byteorder::WriteBytesExt;

    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.write_u32::<LittleEndian>(36 + data_len).unwrap();
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.write_u32::<LittleEndian>(16).unwrap();
    out.write_u16::<LittleEndian>(1).unwrap();
    out.write_u16::<LittleEndian>(channels).unwrap();
    out.write_u32::<LittleEndian>(sample_rate).unwrap();
    out.write_u32::<LittleEndian>(sample_rate * channels as u32 * 2).unwrap();
    out.write_u16::<LittleEndian>(channels * 2).unwrap();
    out.write_u16::<LittleEndian>(16).unwrap();
    out.extend_from_slice(b"data");
    out.write_u32::<LittleEndian>(data_len).unwrap();
    for s in samples {
        out.write_i16::<LittleEndian>(*s).unwrap();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> FileValidator {
        FileValidator::new(1024 * 1024)
    }

    fn validate(name: &str, data: Vec<u8>) -> CoreResult<ValidatedAudio> {
        validator().validate(name, Bytes::from(data))
    }

    fn padded(prefix: &[u8]) -> Vec<u8> {
        let mut data = prefix.to_vec();
        data.resize(64, 0);
        data
    }

    /// Ogg page header with a single segment carrying `packet`.
    fn ogg_first_page(packet: &[u8]) -> Vec<u8> {
        let mut data = b"OggS\x00\x02".to_vec();
        data.resize(26, 0);
        data.push(1);
        data.push(packet.len() as u8);
        data.extend_from_slice(packet);
        data
    }

    /// EBML header followed by a CodecID element.
    fn matroska_with_codec(codec: &[u8]) -> Vec<u8> {
        let mut data = EBML_MAGIC.to_vec();
        data.extend_from_slice(&[0x9F, 0x42, 0x86, 0x81, 0x01]);
        data.extend_from_slice(b"\x42\x82\x88matroska");
        data.extend_from_slice(&[0x86, 0x80 | codec.len() as u8]);
        data.extend_from_slice(codec);
        data.resize(128, 0);
        data
    }

    #[test]
    fn test_minimal_samples_of_each_container() {
        let cases: Vec<(&str, Vec<u8>, AudioFormat)> = vec![
            ("a.wav", encode_wav(&[0; 16], 16000, 1), AudioFormat::Wav),
            ("a.mp3", padded(b"ID3\x04\x00\x00"), AudioFormat::Mp3),
            ("a.mp3", padded(&[0xFF, 0xFB, 0x90, 0x64]), AudioFormat::Mp3),
            ("a.flac", padded(b"fLaC\x00\x00\x00\x22"), AudioFormat::Flac),
            ("a.ogg", ogg_first_page(b"\x01vorbis"), AudioFormat::Ogg),
            ("a.oga", ogg_first_page(b"\x7FFLAC\x01\x00"), AudioFormat::Ogg),
            ("a.m4a", padded(b"\x00\x00\x00\x20ftypM4A "), AudioFormat::Mp4),
            ("a.mov", padded(b"\x00\x00\x00\x14ftypqt  "), AudioFormat::Mp4),
            ("a.aac", padded(&[0xFF, 0xF1, 0x50, 0x80]), AudioFormat::Aac),
            ("a.mka", matroska_with_codec(b"A_VORBIS"), AudioFormat::Mkv),
        ];

        for (name, data, expected) in cases {
            let validated = validate(name, data).unwrap_or_else(|e| panic!("{}: {}", name, e));
            assert_eq!(validated.format, expected, "{}", name);
            assert_eq!(validated.file_name, name);
        }
    }

    #[test]
    fn test_containers_without_a_decoder_are_unsupported() {
        let cases: Vec<(&str, Vec<u8>)> = vec![
            ("a.wma", padded(&ASF_GUID)),
            ("a.avi", padded(b"RIFF\x24\x00\x00\x00AVI LIST")),
            ("a.opus", ogg_first_page(b"OpusHead\x01\x01")),
            ("voice.ogg", ogg_first_page(b"OpusHead\x01\x01")),
            ("a.ogg", ogg_first_page(b"Speex   1.2")),
            ("a.webm", matroska_with_codec(b"A_OPUS")),
            ("a.mkv", matroska_with_codec(b"A_OPUS")),
            // declared only, nothing recognisable inside
            ("a.wma", b"not really windows media".to_vec()),
            ("a.webm", b"not really webm".to_vec()),
        ];

        for (name, data) in cases {
            let err = validate(name, data).unwrap_err();
            assert!(
                matches!(err, TranscriptionError::UnsupportedCodec(_)),
                "{}: {:?}",
                name,
                err
            );
        }
    }

    #[test]
    fn test_supported_extensions_map_to_formats() {
        for ext in SUPPORTED_EXTENSIONS {
            assert!(
                AudioFormat::from_extension(ext.trim_start_matches('.')).is_some(),
                "{}",
                ext
            );
        }
        for ext in ["wma", "avi", "opus", "webm"] {
            assert_eq!(AudioFormat::from_extension(ext), None, "{}", ext);
        }
    }

    #[test]
    fn test_empty_payload() {
        assert_eq!(validate("a.wav", vec![]).unwrap_err(), TranscriptionError::EmptyPayload);
        assert_eq!(validate("notes.txt", vec![]).unwrap_err(), TranscriptionError::EmptyPayload);
    }

    #[test]
    fn test_text_file_is_unsupported() {
        let err = validate("notes.txt", b"hello, this is not audio".to_vec()).unwrap_err();
        assert!(matches!(err, TranscriptionError::UnsupportedCodec(_)));

        let err = validate("noextension", b"hello".to_vec()).unwrap_err();
        assert!(matches!(err, TranscriptionError::UnsupportedCodec(_)));
    }

    #[test]
    fn test_garbage_with_audio_extension_is_invalid() {
        let err = validate("song.mp3", b"definitely not an mp3".to_vec()).unwrap_err();
        assert!(matches!(err, TranscriptionError::InvalidFormat(_)));
    }

    #[test]
    fn test_sniffed_format_wins_over_extension() {
        let validated = validate("recording.mp3", encode_wav(&[0; 8], 8000, 2)).unwrap();
        assert_eq!(validated.format, AudioFormat::Wav);
    }

    #[test]
    fn test_wav_header_integrity() {
        let mut zero_channels = encode_wav(&[0; 8], 16000, 1);
        zero_channels[22] = 0;
        zero_channels[23] = 0;
        assert!(matches!(
            validate("a.wav", zero_channels).unwrap_err(),
            TranscriptionError::InvalidFormat(_)
        ));

        let mut zero_rate = encode_wav(&[0; 8], 16000, 1);
        zero_rate[24..28].copy_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            validate("a.wav", zero_rate).unwrap_err(),
            TranscriptionError::InvalidFormat(_)
        ));

        let truncated = b"RIFF\x04\x00\x00\x00WAVE".to_vec();
        assert!(matches!(
            validate("a.wav", truncated).unwrap_err(),
            TranscriptionError::InvalidFormat(_)
        ));
    }

    #[test]
    fn test_wav_with_leading_chunk() {
        let wav = encode_wav(&[0; 8], 16000, 1);
        let mut with_list = wav[..12].to_vec();
        with_list.extend_from_slice(b"LIST\x03\x00\x00\x00abc\x00");
        with_list.extend_from_slice(&wav[12..]);
        assert_eq!(validate("a.wav", with_list).unwrap().format, AudioFormat::Wav);
    }

    #[test]
    fn test_size_limit() {
        let small = FileValidator::new(32);
        let err = small
            .validate("a.wav", Bytes::from(encode_wav(&[0; 64], 16000, 1)))
            .unwrap_err();
        assert!(matches!(err, TranscriptionError::InvalidFormat(_)));
    }
}
