//! # PCM Frames and Format Conversion
//!
//! The wire format is 16-bit little-endian PCM, mono, at the configured
//! sample rate. This module owns every conversion on the way there:
//! byte/sample packing, float/integer transcoding, channel downmix, linear
//! resampling, and the fixed-size framing accumulator the capture pipeline
//! feeds.

use crate::error::{VoiceError, VoiceResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::time::Instant;

/// One fixed-duration chunk of captured audio.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono PCM16 samples at the configured target rate
    pub samples: Vec<i16>,
    /// Monotonic frame counter within one capture run
    pub sequence: u64,
    /// When the frame left the assembler
    pub captured_at: Instant,
}

impl AudioFrame {
    /// Wire representation: little-endian byte stream.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        pcm16_to_le_bytes(&self.samples)
    }
}

/// Clamp a float sample into [-1, 1] and quantize to i16.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

/// Dequantize i16 samples to floats in [-1, 1).
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Pack samples into the little-endian wire byte order.
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing to a Vec cannot fail.
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Unpack a little-endian byte stream into samples.
///
/// An odd byte count means a truncated or corrupt payload and is rejected
/// rather than silently dropping the trailing byte.
pub fn le_bytes_to_pcm16(bytes: &[u8]) -> VoiceResult<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Protocol(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    for _ in 0..bytes.len() / 2 {
        samples.push(
            cursor
                .read_i16::<LittleEndian>()
                .map_err(|e| VoiceError::Protocol(format!("PCM16 read failed: {}", e)))?,
        );
    }
    Ok(samples)
}

/// Average interleaved multi-channel float samples down to mono.
pub fn downmix_mono(data: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    let channels = channels as usize;
    data.chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resample from `from_rate` to `to_rate`.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = (src_pos - idx as f64) as f32;

        let a = samples[idx.min(samples.len() - 1)];
        let b = samples[(idx + 1).min(samples.len() - 1)];
        out.push(a + (b - a) * frac);
    }

    out
}

/// Accumulates samples and emits fixed-size frames.
///
/// The capture callback pushes whatever buffer sizes the device delivers;
/// the assembler re-chunks them so every frame on the wire has exactly
/// `frame_samples` samples. `flush` emits the partial remainder when
/// capture stops.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<i16>,
    sequence: u64,
}

impl FrameAssembler {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
            sequence: 0,
        }
    }

    /// Add samples; returns zero or more completed frames.
    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            let samples = std::mem::replace(&mut self.pending, rest);
            frames.push(self.emit(samples));
        }
        frames
    }

    /// Emit the partial remainder, if any. Called when capture stops so the
    /// tail of the utterance is not lost.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if self.pending.is_empty() {
            return None;
        }
        let samples = std::mem::take(&mut self.pending);
        Some(self.emit(samples))
    }

    fn emit(&mut self, samples: Vec<i16>) -> AudioFrame {
        let frame = AudioFrame {
            samples,
            sequence: self.sequence,
            captured_at: Instant::now(),
        };
        self.sequence += 1;
        frame
    }
}
