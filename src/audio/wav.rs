//! WAV encoding and decoding with hound
//!
//! Captured frames are joined, downmixed to mono, and wrapped as 16-bit PCM
//! WAV at the capture rate. Decoding produces normalized f32 samples for
//! playback.

use std::io::{Cursor, Read};
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use super::buffer::Frame;
use super::recorder::AudioError;

/// Decoded audio ready for an output stream
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Interleaved samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Clip length in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.channels as f64 / self.sample_rate as f64
    }
}

/// Concatenate frames in order and average interleaved channels down to mono.
pub fn frames_to_mono(frames: &[Frame]) -> Vec<i16> {
    let total: usize = frames.iter().map(|f| f.sample_frames()).sum();
    let mut mono = Vec::with_capacity(total);

    for frame in frames {
        let channels = frame.channels.max(1) as usize;
        if channels == 1 {
            mono.extend_from_slice(&frame.samples);
            continue;
        }
        for chunk in frame.samples.chunks_exact(channels) {
            let sum: i32 = chunk.iter().map(|&s| s as i32).sum();
            mono.push((sum / channels as i32) as i16);
        }
    }

    mono
}

/// Encode frames as a mono 16-bit PCM WAV at `sample_rate`.
pub fn encode_frames(frames: &[Frame], sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    encode_pcm16(&frames_to_mono(frames), sample_rate)
}

/// Wrap mono PCM16 samples in a WAV container.
pub fn encode_pcm16(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|e| AudioError::EncodeFailed(e.to_string()))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| AudioError::EncodeFailed(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| AudioError::EncodeFailed(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Decode WAV bytes into normalized f32 samples.
pub fn decode_bytes(bytes: &[u8]) -> Result<DecodedAudio, hound::Error> {
    decode(WavReader::new(Cursor::new(bytes))?)
}

/// Decode a WAV file into normalized f32 samples.
pub fn decode_file(path: &Path) -> Result<DecodedAudio, hound::Error> {
    decode(WavReader::open(path)?)
}

fn decode<R: Read>(mut reader: WavReader<R>) -> Result<DecodedAudio, hound::Error> {
    let spec = reader.spec();

    let samples = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    Ok(DecodedAudio {
        samples,
        channels: spec.channels,
        sample_rate: spec.sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_then_decode_preserves_rate_and_length() {
        let frames = vec![
            Frame::new(vec![0, 1000, -1000, 0], 1, 0),
            Frame::new(vec![16384, -16384], 1, 1),
        ];

        let bytes = encode_frames(&frames, 16_000).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");

        let decoded = decode_bytes(&bytes).unwrap();
        assert_eq!(decoded.sample_rate, 16_000);
        assert_eq!(decoded.channels, 1);
        assert_eq!(decoded.samples.len(), 6);
        assert!((decoded.samples[4] - 0.5).abs() < 1e-4);
        assert!((decoded.samples[5] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_encoded_samples_are_bit_exact() {
        let frames = vec![
            Frame::new(vec![i16::MIN, -1, 0, 1, i16::MAX], 1, 0),
            Frame::new(vec![12345, -12345, 7], 1, 1),
        ];

        let bytes = encode_frames(&frames, 16_000).unwrap();
        let mut reader = WavReader::new(Cursor::new(&bytes)).unwrap();
        assert_eq!(reader.spec().bits_per_sample, 16);
        let samples = reader
            .samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(samples, frames_to_mono(&frames));
        assert_eq!(samples.len(), 8);
        assert_eq!(samples[0], i16::MIN);
        assert_eq!(samples[4], i16::MAX);
    }

    #[test]
    fn test_stereo_frames_are_downmixed() {
        let frames = vec![Frame::new(vec![100, 300, -200, -400], 2, 0)];
        assert_eq!(frames_to_mono(&frames), vec![200, -300]);
    }

    #[test]
    fn test_empty_frames_encode_header_only() {
        let bytes = encode_frames(&[], 16_000).unwrap();
        let decoded = decode_bytes(&bytes).unwrap();
        assert!(decoded.samples.is_empty());
        assert_eq!(decoded.duration_secs(), 0.0);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_bytes(b"definitely not a wav file").is_err());
    }

    #[test]
    fn test_decode_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        std::fs::write(&path, encode_pcm16(&[0i16; 8000], 16_000).unwrap()).unwrap();

        let decoded = decode_file(&path).unwrap();
        assert!((decoded.duration_secs() - 0.5).abs() < 1e-9);
    }
}
