//! Per-session VAD tunables.
//!
//! `VadConfig` is the full set of recognised keys with defaults. Clients send a
//! `VadConfigPatch`; it is merged over the session's current config, never
//! replacing it wholesale.

use serde::{Deserialize, Serialize};

/// PCM16 mono.
pub const BYTES_PER_SAMPLE: usize = 2;

pub const MIN_SENSITIVITY_FACTOR: f32 = 1.2;
pub const MAX_SENSITIVITY_FACTOR: f32 = 2.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct VadConfig {
    /// Sample rate of incoming PCM in Hz.
    pub sample_rate: u32,
    /// Length of one classified frame in milliseconds.
    pub frame_duration_ms: u32,
    /// Bitstream classifier sensitivity, 0 (lenient) to 3 (strict).
    pub aggressiveness: u8,
    pub use_rms_vad: bool,
    pub use_bitstream_vad: bool,
    pub use_neural_vad: bool,
    pub rms_weight: f32,
    pub bitstream_weight: f32,
    pub neural_weight: f32,
    /// Idle time after which the registry sweep evicts the session.
    pub session_timeout_ms: u64,
    /// Noise analyzer sensitivity; applied immediately when updated.
    pub initial_sensitivity_factor: f32,
    /// Verbose debug-state payloads.
    pub debug: bool,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_duration_ms: 30,
            aggressiveness: 2,
            use_rms_vad: true,
            use_bitstream_vad: true,
            use_neural_vad: true,
            rms_weight: 0.2,
            bitstream_weight: 0.4,
            neural_weight: 0.4,
            session_timeout_ms: 300_000,
            initial_sensitivity_factor: 1.5,
            debug: false,
        }
    }
}

impl VadConfig {
    /// Clamp every field into its legal range.
    pub fn normalize(&mut self) {
        if self.sample_rate == 0 {
            self.sample_rate = 16_000;
        }
        if self.frame_duration_ms == 0 {
            self.frame_duration_ms = 30;
        }
        self.aggressiveness = self.aggressiveness.min(3);
        self.rms_weight = sanitize_weight(self.rms_weight);
        self.bitstream_weight = sanitize_weight(self.bitstream_weight);
        self.neural_weight = sanitize_weight(self.neural_weight);
        self.initial_sensitivity_factor = clamp_sensitivity(self.initial_sensitivity_factor);
    }

    /// Samples in one frame.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as u64 * self.frame_duration_ms as u64 / 1000) as usize
    }

    /// Bytes in one PCM16 frame.
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples() * BYTES_PER_SAMPLE
    }

    /// Merge `patch` into this config and report which derived state must be rebuilt.
    pub fn apply(&mut self, patch: &VadConfigPatch) -> ConfigChanges {
        let before = self.clone();

        if let Some(v) = patch.sample_rate {
            self.sample_rate = v;
        }
        if let Some(v) = patch.frame_duration_ms {
            self.frame_duration_ms = v;
        }
        if let Some(v) = patch.aggressiveness {
            self.aggressiveness = v;
        }
        if let Some(v) = patch.use_rms_vad {
            self.use_rms_vad = v;
        }
        if let Some(v) = patch.use_bitstream_vad {
            self.use_bitstream_vad = v;
        }
        if let Some(v) = patch.use_neural_vad {
            self.use_neural_vad = v;
        }
        if let Some(v) = patch.rms_weight {
            self.rms_weight = v;
        }
        if let Some(v) = patch.bitstream_weight {
            self.bitstream_weight = v;
        }
        if let Some(v) = patch.neural_weight {
            self.neural_weight = v;
        }
        if let Some(v) = patch.session_timeout_ms {
            self.session_timeout_ms = v;
        }
        if let Some(v) = patch.initial_sensitivity_factor {
            self.initial_sensitivity_factor = v;
        }
        if let Some(v) = patch.debug {
            self.debug = v;
        }
        self.normalize();

        ConfigChanges {
            sample_rate: self.sample_rate != before.sample_rate,
            aggressiveness: patch.aggressiveness.is_some(),
            sensitivity: patch.initial_sensitivity_factor.is_some(),
            session_timeout: self.session_timeout_ms != before.session_timeout_ms,
            recalibrate: patch.recalibrate.unwrap_or(false),
        }
    }
}

/// Partial config sent by clients with `updateVadConfig`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct VadConfigPatch {
    pub sample_rate: Option<u32>,
    pub frame_duration_ms: Option<u32>,
    pub aggressiveness: Option<u8>,
    pub use_rms_vad: Option<bool>,
    pub use_bitstream_vad: Option<bool>,
    pub use_neural_vad: Option<bool>,
    pub rms_weight: Option<f32>,
    pub bitstream_weight: Option<f32>,
    pub neural_weight: Option<f32>,
    pub session_timeout_ms: Option<u64>,
    pub initial_sensitivity_factor: Option<f32>,
    pub debug: Option<bool>,
    /// Restart noise calibration after applying the patch.
    pub recalibrate: Option<bool>,
}

/// Derived state touched by a merged patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigChanges {
    pub sample_rate: bool,
    pub aggressiveness: bool,
    pub sensitivity: bool,
    pub session_timeout: bool,
    pub recalibrate: bool,
}

pub fn clamp_sensitivity(factor: f32) -> f32 {
    if factor.is_finite() {
        factor.clamp(MIN_SENSITIVITY_FACTOR, MAX_SENSITIVITY_FACTOR)
    } else {
        1.5
    }
}

fn sanitize_weight(weight: f32) -> f32 {
    if weight.is_finite() {
        weight.max(0.0)
    } else {
        0.0
    }
}
