//! Container demuxing and codec decoding via symphonia.
//!
//! Works entirely in memory: the validated upload is wrapped in a cursor
//! and handed to symphonia's probe with the sniffed format as a hint.

use crate::audio::validator::ValidatedAudio;
use crate::error::{CoreResult, TranscriptionError};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Interleaved `f32` samples at the source rate.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }
}

/// Decode the first audio track of a validated upload.
pub fn decode(audio: &ValidatedAudio) -> CoreResult<DecodedAudio> {
    let failure = |msg: String| TranscriptionError::DecodeFailure(msg);

    let source = Cursor::new(audio.bytes.clone());
    let mss = MediaSourceStream::new(Box::new(source), Default::default());

    let mut hint = Hint::new();
    hint.with_extension(audio.format.hint_extension());

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| failure(format!("unrecognised container: {}", e)))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| failure("no audio track found".to_string()))?;

    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;
    let mut channels = track.codec_params.channels.map(|c| c.count());

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| failure(format!("unsupported codec: {}", e)))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut skipped_packets = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => {
                if samples.is_empty() {
                    return Err(failure(format!("failed to read stream: {}", e)));
                }
                warn!(file_name = %audio.file_name, "Stopping decode early: {}", e);
                break;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                skipped_packets += 1;
                debug!("Skipping undecodable packet: {}", e);
                continue;
            }
            Err(e) => return Err(failure(format!("decoder error: {}", e))),
        };

        let spec = *decoded.spec();
        if decoded.frames() == 0 {
            continue;
        }
        sample_rate.get_or_insert(spec.rate);
        channels.get_or_insert(spec.channels.count());

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buffer.samples());
    }

    let sample_rate = sample_rate
        .filter(|rate| *rate > 0)
        .ok_or_else(|| failure("stream has no sample rate".to_string()))?;
    let channels = channels
        .filter(|count| *count > 0)
        .ok_or_else(|| failure("stream has no channels".to_string()))?;

    if skipped_packets > 0 {
        warn!(file_name = %audio.file_name, skipped_packets, "Some packets could not be decoded");
    }

    debug!(
        file_name = %audio.file_name,
        sample_rate,
        channels,
        samples = samples.len(),
        "Decoded audio"
    );

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::validator::{encode_wav, AudioFormat, FileValidator};
    use bytes::Bytes;
    use symphonia::core::codecs::{
        CodecType, CODEC_TYPE_AAC, CODEC_TYPE_ALAC, CODEC_TYPE_FLAC, CODEC_TYPE_MP3,
        CODEC_TYPE_OPUS, CODEC_TYPE_PCM_F32LE, CODEC_TYPE_PCM_S16LE, CODEC_TYPE_VORBIS,
    };

    fn validated(name: &str, data: Vec<u8>) -> ValidatedAudio {
        FileValidator::new(usize::MAX)
            .validate(name, Bytes::from(data))
            .unwrap()
    }

    #[test]
    fn test_decode_stereo_wav() {
        let samples: Vec<i16> = (0..800).map(|i| if i % 2 == 0 { 16384 } else { -16384 }).collect();
        let audio = validated("stereo.wav", encode_wav(&samples, 8000, 2));

        let decoded = decode(&audio).unwrap();
        assert_eq!(decoded.sample_rate, 8000);
        assert_eq!(decoded.channels, 2);
        assert_eq!(decoded.frames(), 400);
        assert!((decoded.samples[0] - 0.5).abs() < 1e-3);
        assert!((decoded.samples[1] + 0.5).abs() < 1e-3);
    }

    /// MPEG-1 Layer III, 128 kbit/s, 44.1 kHz, mono. Zeroed side info and
    /// main data decode to silence.
    fn silent_mp3(frames: usize) -> Vec<u8> {
        const FRAME_LEN: usize = 417;
        let mut data = Vec::with_capacity(frames * FRAME_LEN);
        for _ in 0..frames {
            let start = data.len();
            data.extend_from_slice(&[0xFF, 0xFB, 0x90, 0xC4]);
            data.resize(start + FRAME_LEN, 0);
        }
        data
    }

    fn flac_crc8(data: &[u8]) -> u8 {
        data.iter().fold(0u8, |mut crc, byte| {
            crc ^= byte;
            for _ in 0..8 {
                crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x07 } else { crc << 1 };
            }
            crc
        })
    }

    fn flac_crc16(data: &[u8]) -> u16 {
        data.iter().fold(0u16, |mut crc, byte| {
            crc ^= (*byte as u16) << 8;
            for _ in 0..8 {
                crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x8005 } else { crc << 1 };
            }
            crc
        })
    }

    /// 16 kHz mono 16-bit FLAC made of verbatim frames of 256 samples.
    fn verbatim_flac(value: i16, frames: u8) -> Vec<u8> {
        const BLOCK: u16 = 256;
        let total = BLOCK as u64 * frames as u64;

        let mut data = b"fLaC".to_vec();
        // last metadata block, STREAMINFO, 34 bytes
        data.extend_from_slice(&[0x80, 0x00, 0x00, 0x22]);
        data.extend_from_slice(&BLOCK.to_be_bytes());
        data.extend_from_slice(&BLOCK.to_be_bytes());
        data.extend_from_slice(&[0u8; 6]);
        // 20-bit rate, 3-bit channels-1, 5-bit bps-1, 36-bit total samples
        let packed: u64 = (16000u64 << 44) | (15u64 << 36) | total;
        data.extend_from_slice(&packed.to_be_bytes());
        data.extend_from_slice(&[0u8; 16]);

        for number in 0..frames {
            let mut frame = vec![0xFF, 0xF8, 0x60, 0x08, number, (BLOCK - 1) as u8];
            frame.push(flac_crc8(&frame));
            frame.push(0x02);
            for _ in 0..BLOCK {
                frame.extend_from_slice(&value.to_be_bytes());
            }
            let crc = flac_crc16(&frame);
            frame.extend_from_slice(&crc.to_be_bytes());
            data.extend_from_slice(&frame);
        }
        data
    }

    #[test]
    fn test_decode_mp3_frames() {
        let audio = validated("silence.mp3", silent_mp3(12));
        assert_eq!(audio.format, AudioFormat::Mp3);

        let decoded = decode(&audio).unwrap();
        assert_eq!(decoded.sample_rate, 44100);
        assert_eq!(decoded.channels, 1);
        assert!(decoded.frames() >= 1152);
        assert!(decoded.samples.iter().all(|s| s.abs() < 1e-3));
    }

    #[test]
    fn test_decode_flac_frames() {
        let audio = validated("tone.flac", verbatim_flac(8192, 4));
        assert_eq!(audio.format, AudioFormat::Flac);

        let decoded = decode(&audio).unwrap();
        assert_eq!(decoded.sample_rate, 16000);
        assert_eq!(decoded.channels, 1);
        assert!(decoded.frames() >= 256);
        assert!((decoded.samples[0] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn test_every_accepted_format_has_a_codec() {
        let needs: [(AudioFormat, &[CodecType]); 7] = [
            (AudioFormat::Wav, &[CODEC_TYPE_PCM_S16LE, CODEC_TYPE_PCM_F32LE]),
            (AudioFormat::Mp3, &[CODEC_TYPE_MP3]),
            (AudioFormat::Flac, &[CODEC_TYPE_FLAC]),
            (AudioFormat::Ogg, &[CODEC_TYPE_VORBIS, CODEC_TYPE_FLAC]),
            (AudioFormat::Mp4, &[CODEC_TYPE_AAC, CODEC_TYPE_ALAC]),
            (AudioFormat::Aac, &[CODEC_TYPE_AAC]),
            (AudioFormat::Mkv, &[CODEC_TYPE_VORBIS, CODEC_TYPE_FLAC]),
        ];

        let codecs = symphonia::default::get_codecs();
        for (format, types) in needs {
            for codec in types {
                assert!(codecs.get_codec(*codec).is_some(), "{:?}", format);
            }
        }
        assert!(codecs.get_codec(CODEC_TYPE_OPUS).is_none());
    }

    #[test]
    fn test_header_only_mp3_fails_to_decode() {
        let mut data = b"ID3\x04\x00\x00\x00\x00\x00\x00".to_vec();
        data.extend_from_slice(&[0u8; 32]);
        let audio = validated("broken.mp3", data);
        assert!(matches!(decode(&audio), Err(TranscriptionError::DecodeFailure(_))));
    }
}
