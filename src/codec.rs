//! PCM shims between device samples and the Live API's base64 PCM16LE chunks.

use crate::error::DecodeError;
use base64::engine::general_purpose;
use base64::Engine;

/// One capture tick of normalized mono samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Wire-format audio ready for `realtimeInput.audio`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAudioChunk {
    pub data: String,
    pub mime_type: String,
}

/// Playable mono samples at the agent's output rate.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl DecodedAudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Convert raw S16LE capture samples into a normalized frame.
pub fn frame_from_pcm16(pcm: &[i16], sample_rate: u32) -> AudioFrame {
    AudioFrame {
        samples: pcm.iter().map(|&s| s as f32 / 32768.0).collect(),
        sample_rate,
    }
}

/// Audio Frame Encoder: normalized samples -> base64 PCM16LE.
pub fn encode_frame(frame: &AudioFrame) -> EncodedAudioChunk {
    let mut bytes = Vec::with_capacity(frame.samples.len() * 2);
    for &sample in &frame.samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let value = if clamped < 0.0 {
            clamped * 32768.0
        } else {
            clamped * 32767.0
        };
        bytes.extend_from_slice(&(value as i16).to_le_bytes());
    }

    EncodedAudioChunk {
        data: general_purpose::STANDARD.encode(&bytes),
        mime_type: format!("audio/pcm;rate={}", frame.sample_rate),
    }
}

/// Audio Chunk Decoder: base64 PCM16LE -> playable buffer at `sample_rate`.
pub fn decode_chunk(data: &str, sample_rate: u32) -> Result<DecodedAudioBuffer, DecodeError> {
    let bytes = general_purpose::STANDARD.decode(data.trim())?;
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();

    Ok(DecodedAudioBuffer::new(samples, sample_rate))
}
