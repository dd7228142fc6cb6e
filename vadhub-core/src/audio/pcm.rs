//! Base64 PCM16 decoding and frame slicing.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{Result, VadError};

/// Full-scale magnitude of a signed 16-bit sample.
const PCM16_FULL_SCALE: f32 = 32_768.0;

/// A decoded chunk of raw PCM16 bytes.
#[derive(Debug, Clone)]
pub struct PcmChunk {
    bytes: Vec<u8>,
}

impl PcmChunk {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Decode a base64 payload.
    ///
    /// # Errors
    /// `VadError::Decode` when the payload is not valid base64.
    pub fn from_base64(payload: &str) -> Result<Self> {
        STANDARD
            .decode(payload.trim())
            .map(Self::new)
            .map_err(|e| VadError::Decode(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Full frames of `frame_bytes` each. A trailing partial frame is dropped,
    /// and a zero frame size yields nothing.
    pub fn frames(&self, frame_bytes: usize) -> impl Iterator<Item = &[u8]> {
        let usable: &[u8] = if frame_bytes == 0 { &[] } else { &self.bytes };
        // chunks_exact panics on zero.
        usable.chunks_exact(frame_bytes.max(1))
    }
}

/// Interpret little-endian PCM16 bytes as samples. An odd trailing byte is ignored.
pub fn pcm16_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// PCM16 samples as f32 in [-1.0, 1.0).
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&s| s as f32 / PCM16_FULL_SCALE)
        .collect()
}

/// Root-mean-square energy of PCM16 samples, normalised to [0, 1].
pub fn normalized_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    ((sum_sq / samples.len() as f64).sqrt() as f32 / PCM16_FULL_SCALE).min(1.0)
}
