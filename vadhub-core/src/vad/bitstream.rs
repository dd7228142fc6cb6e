//! Fixed-window bitstream classifier over raw PCM16 frames.
//!
//! The contract is the classic WebRTC detector's: a frame is only accepted at
//! 8/16/32/48 kHz and 10/20/30 ms, and an aggressiveness mode 0–3 trades
//! recall for precision. Anything else is a length mismatch and the ensemble
//! treats the vote as `false`.
//!
//! `WebRtcVad` is the built-in implementation, backed by `earshot` (a
//! pure-Rust port of the WebRTC GMM detector).

use std::sync::Arc;

use earshot::{VoiceActivityDetector, VoiceActivityProfile};

use super::VadDecision;
use crate::error::{Result, VadError};

pub const SUPPORTED_SAMPLE_RATES: [u32; 4] = [8_000, 16_000, 32_000, 48_000];
pub const SUPPORTED_FRAME_MS: [u32; 3] = [10, 20, 30];

/// Deterministic per-frame classifier over PCM16 samples.
pub trait BitstreamClassifier: Send + 'static {
    /// Classify one frame.
    ///
    /// # Errors
    /// `VadError::Classifier` when the rate or frame length is unsupported.
    fn classify(&mut self, frame: &[i16], sample_rate: u32) -> Result<VadDecision>;
}

/// Builds a classifier for a given aggressiveness mode.
///
/// Sessions rebuild their classifier through this when `aggressiveness`
/// changes, so the new mode applies without recreating the session.
pub type BitstreamFactory = Arc<dyn Fn(u8) -> Box<dyn BitstreamClassifier> + Send + Sync>;

/// Factory for the built-in `WebRtcVad`.
pub fn default_factory() -> BitstreamFactory {
    Arc::new(|aggressiveness: u8| -> Box<dyn BitstreamClassifier> {
        Box::new(WebRtcVad::new(aggressiveness))
    })
}

/// Check that `len` samples form a supported frame at `sample_rate`.
pub fn validate_frame(len: usize, sample_rate: u32) -> Result<()> {
    if !SUPPORTED_SAMPLE_RATES.contains(&sample_rate) {
        return Err(VadError::Classifier(format!(
            "unsupported sample rate {sample_rate} Hz"
        )));
    }
    let valid = SUPPORTED_FRAME_MS
        .iter()
        .any(|ms| (sample_rate * ms / 1000) as usize == len);
    if !valid {
        return Err(VadError::Classifier(format!(
            "frame of {len} samples is not 10/20/30 ms at {sample_rate} Hz"
        )));
    }
    Ok(())
}

/// WebRTC GMM voice activity detector.
pub struct WebRtcVad {
    detector: VoiceActivityDetector,
    mode: u8,
}

impl WebRtcVad {
    /// `aggressiveness` above 3 is treated as 3.
    pub fn new(aggressiveness: u8) -> Self {
        let mode = aggressiveness.min(3);
        let profile = match mode {
            0 => VoiceActivityProfile::QUALITY,
            1 => VoiceActivityProfile::LBR,
            2 => VoiceActivityProfile::AGGRESSIVE,
            _ => VoiceActivityProfile::VERY_AGGRESSIVE,
        };
        Self {
            detector: VoiceActivityDetector::new(profile),
            mode,
        }
    }

    pub fn aggressiveness(&self) -> u8 {
        self.mode
    }
}

impl std::fmt::Debug for WebRtcVad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcVad")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl BitstreamClassifier for WebRtcVad {
    fn classify(&mut self, frame: &[i16], sample_rate: u32) -> Result<VadDecision> {
        validate_frame(frame.len(), sample_rate)?;

        let verdict = match sample_rate {
            8_000 => self.detector.predict_8khz(frame),
            16_000 => self.detector.predict_16khz(frame),
            32_000 => self.detector.predict_32khz(frame),
            _ => self.detector.predict_48khz(frame),
        };
        verdict
            .map(VadDecision::from)
            .map_err(|e| VadError::Classifier(format!("{e:?}")))
    }
}
