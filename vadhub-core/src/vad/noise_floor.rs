//! Adaptive noise-floor analyzer over a scalar energy stream.
//!
//! ## Algorithm
//!
//! 1. **Calibrating**: collect levels until `calibration_duration_ms` has
//!    elapsed, then set `noise_floor = mean`, `std_dev = sample std-dev`
//!    (defaults `0.02` / `0.01` with fewer than 5 samples).
//! 2. **Ready**: threshold is `noise_floor + std_dev * sensitivity_factor`.
//!    A raw decision is `level > threshold`; `consecutive_frames_threshold`
//!    matching raw decisions are needed before the confirmed state flips.
//! 3. After `silence_duration_for_recal_ms` without speech, and at most once
//!    per `recalibration_interval_ms`, the floor is smoothed toward the mean of
//!    the last 10 levels and the sensitivity factor adapts to how stable the
//!    background is.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{clamp_sensitivity, MAX_SENSITIVITY_FACTOR, MIN_SENSITIVITY_FACTOR};

/// Threshold reported before calibration has completed.
pub const DEFAULT_THRESHOLD: f32 = 0.1;
const FALLBACK_NOISE_FLOOR: f32 = 0.02;
const FALLBACK_STD_DEV: f32 = 0.01;
const MIN_CALIBRATION_SAMPLES: usize = 5;
const RECAL_WINDOW: usize = 10;
const PROFILE_RECENT_LEVELS: usize = 5;
const DEBUG_RECENT_LEVELS: usize = 10;
/// Background std-dev below which the threshold tightens.
const STABLE_STD_DEV: f32 = 0.01;
/// Background std-dev above which the threshold loosens.
const VOLATILE_STD_DEV: f32 = 0.1;
const SENSITIVITY_HYSTERESIS: f32 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AnalyzerConfig {
    pub initial_sensitivity_factor: f32,
    pub calibration_duration_ms: u64,
    pub recalibration_interval_ms: u64,
    pub silence_duration_for_recal_ms: u64,
    pub max_sample_history: usize,
    pub smoothing_factor: f32,
    pub consecutive_frames_threshold: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            initial_sensitivity_factor: 1.5,
            calibration_duration_ms: 2_000,
            recalibration_interval_ms: 5_000,
            silence_duration_for_recal_ms: 2_000,
            max_sample_history: 50,
            smoothing_factor: 0.1,
            consecutive_frames_threshold: 2,
        }
    }
}

impl AnalyzerConfig {
    pub fn normalize(&mut self) {
        self.initial_sensitivity_factor = clamp_sensitivity(self.initial_sensitivity_factor);
        self.max_sample_history = self.max_sample_history.max(RECAL_WINDOW);
        self.smoothing_factor = if self.smoothing_factor.is_finite() {
            self.smoothing_factor.clamp(0.0, 1.0)
        } else {
            0.1
        };
        self.consecutive_frames_threshold = self.consecutive_frames_threshold.max(1);
    }
}

/// Transitions reported by the analyzer.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzerEvent {
    CalibrationStarted { timestamp: u64 },
    CalibrationComplete(NoiseProfile),
    SpeechStart { level: f32, threshold: f32, timestamp: u64 },
    SpeechEnd { level: f32, threshold: f32, timestamp: u64 },
    ThresholdChanged { threshold: f32, sensitivity_factor: f32 },
}

/// Snapshot of the current background estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoiseProfile {
    pub noise_floor: f32,
    pub std_dev: f32,
    pub sensitivity_factor: f32,
    pub threshold: f32,
    pub calibration_complete: bool,
    pub last_calibration_time: u64,
    pub samples_count: usize,
    pub recent_levels: Vec<f32>,
}

/// Outcome of one `add_sample` call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelResult {
    pub level: f32,
    /// `0.0` while calibrating.
    pub threshold: f32,
    /// Debounced speech state after this sample.
    pub is_speech: bool,
    pub profile: NoiseProfile,
    pub timestamp: u64,
    #[serde(skip)]
    pub event: Option<AnalyzerEvent>,
}

/// Verbose analyzer state, only produced when debug output is enabled.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzerDebug {
    pub calibration_complete: bool,
    pub is_calibrating: bool,
    pub samples_count: usize,
    pub noise_floor: f32,
    pub std_dev: f32,
    pub sensitivity_factor: f32,
    pub threshold: f32,
    pub last_calibration_time: u64,
    pub last_speech_time: u64,
    pub last_silence_time: u64,
    pub last_is_speech: bool,
    pub consecutive_speech_frames: u32,
    pub consecutive_silence_frames: u32,
    pub recent_samples: Vec<f32>,
}

/// Rolling noise-floor estimator with a debounced speech verdict.
#[derive(Debug, Clone)]
pub struct NoiseFloorAnalyzer {
    config: AnalyzerConfig,
    debug: bool,
    /// Calibration set while calibrating; bounded rolling window afterwards.
    samples: VecDeque<f32>,
    noise_floor: f32,
    std_dev: f32,
    sensitivity_factor: f32,
    calibrating: bool,
    calibration_complete: bool,
    last_calibration_time: u64,
    is_speech: bool,
    consecutive_speech_frames: u32,
    consecutive_silence_frames: u32,
    last_speech_time: u64,
    last_silence_time: u64,
}

impl NoiseFloorAnalyzer {
    /// Create an analyzer whose calibration window starts at `now_ms`.
    pub fn new(mut config: AnalyzerConfig, now_ms: u64) -> Self {
        config.normalize();
        let mut analyzer = Self {
            sensitivity_factor: config.initial_sensitivity_factor,
            samples: VecDeque::with_capacity(config.max_sample_history + 1),
            config,
            debug: false,
            noise_floor: 0.0,
            std_dev: 0.0,
            calibrating: true,
            calibration_complete: false,
            last_calibration_time: now_ms,
            is_speech: false,
            consecutive_speech_frames: 0,
            consecutive_silence_frames: 0,
            last_speech_time: 0,
            last_silence_time: 0,
        };
        analyzer.start_calibration(now_ms);
        analyzer
    }

    /// Feed one energy level in [0, 1] observed at `timestamp` (epoch ms).
    pub fn add_sample(&mut self, level: f32, timestamp: u64) -> LevelResult {
        if self.calibrating {
            self.samples.push_back(level);
            let mut event = None;
            if timestamp.saturating_sub(self.last_calibration_time)
                >= self.config.calibration_duration_ms
            {
                event = Some(self.complete_calibration());
            }
            return LevelResult {
                level,
                threshold: 0.0,
                is_speech: false,
                profile: self.noise_profile(),
                timestamp,
                event,
            };
        }

        self.samples.push_back(level);
        while self.samples.len() > self.config.max_sample_history {
            self.samples.pop_front();
        }

        let threshold = self.current_threshold();
        let raw_speech = level > threshold;

        if raw_speech {
            self.consecutive_speech_frames += 1;
            self.consecutive_silence_frames = 0;
            self.last_speech_time = timestamp;
        } else {
            self.consecutive_speech_frames = 0;
            self.consecutive_silence_frames += 1;
            self.last_silence_time = timestamp;
        }

        let debounce = self.config.consecutive_frames_threshold;

        if !self.is_speech && self.consecutive_speech_frames >= debounce {
            self.is_speech = true;
            return self.result(
                level,
                threshold,
                timestamp,
                Some(AnalyzerEvent::SpeechStart {
                    level,
                    threshold,
                    timestamp,
                }),
            );
        }

        if self.is_speech && !raw_speech && self.consecutive_silence_frames >= debounce {
            self.is_speech = false;
            return self.result(
                level,
                threshold,
                timestamp,
                Some(AnalyzerEvent::SpeechEnd {
                    level,
                    threshold,
                    timestamp,
                }),
            );
        }

        let mut event = None;
        let silence_for = timestamp.saturating_sub(self.last_speech_time);
        let since_calibration = timestamp.saturating_sub(self.last_calibration_time);
        if !raw_speech
            && silence_for > self.config.silence_duration_for_recal_ms
            && since_calibration > self.config.recalibration_interval_ms
        {
            event = self.recalibrate_from_recent_silence(timestamp);
        }

        self.result(level, threshold, timestamp, event)
    }

    /// Restart calibration, discarding collected samples.
    pub fn force_recalibration(&mut self, now_ms: u64) -> AnalyzerEvent {
        self.start_calibration(now_ms)
    }

    /// Override the sensitivity factor immediately (clamped to [1.2, 2.5]).
    pub fn set_sensitivity_factor(&mut self, factor: f32) {
        self.sensitivity_factor = clamp_sensitivity(factor);
        self.config.initial_sensitivity_factor = self.sensitivity_factor;
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Speech threshold; `DEFAULT_THRESHOLD` until calibration completes.
    pub fn current_threshold(&self) -> f32 {
        if !self.calibration_complete {
            return DEFAULT_THRESHOLD;
        }
        self.noise_floor + self.std_dev * self.sensitivity_factor
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibrating
    }

    /// Debounced state when `level` is `None`, otherwise a raw threshold test.
    pub fn is_speech_detected(&self, level: Option<f32>) -> bool {
        match level {
            Some(level) => level > self.current_threshold(),
            None => self.is_speech,
        }
    }

    pub fn noise_profile(&self) -> NoiseProfile {
        NoiseProfile {
            noise_floor: self.noise_floor,
            std_dev: self.std_dev,
            sensitivity_factor: self.sensitivity_factor,
            threshold: self.current_threshold(),
            calibration_complete: self.calibration_complete,
            last_calibration_time: self.last_calibration_time,
            samples_count: self.samples.len(),
            recent_levels: self.recent(PROFILE_RECENT_LEVELS),
        }
    }

    /// `None` unless debug output is enabled.
    pub fn debug_state(&self) -> Option<AnalyzerDebug> {
        if !self.debug {
            return None;
        }
        Some(AnalyzerDebug {
            calibration_complete: self.calibration_complete,
            is_calibrating: self.calibrating,
            samples_count: self.samples.len(),
            noise_floor: self.noise_floor,
            std_dev: self.std_dev,
            sensitivity_factor: self.sensitivity_factor,
            threshold: self.current_threshold(),
            last_calibration_time: self.last_calibration_time,
            last_speech_time: self.last_speech_time,
            last_silence_time: self.last_silence_time,
            last_is_speech: self.is_speech,
            consecutive_speech_frames: self.consecutive_speech_frames,
            consecutive_silence_frames: self.consecutive_silence_frames,
            recent_samples: self.recent(DEBUG_RECENT_LEVELS),
        })
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn start_calibration(&mut self, now_ms: u64) -> AnalyzerEvent {
        self.calibrating = true;
        self.calibration_complete = false;
        self.samples.clear();
        self.last_calibration_time = now_ms;
        debug!(timestamp = now_ms, "noise calibration started");
        AnalyzerEvent::CalibrationStarted { timestamp: now_ms }
    }

    fn complete_calibration(&mut self) -> AnalyzerEvent {
        if self.samples.len() >= MIN_CALIBRATION_SAMPLES {
            let (mean, std_dev) = mean_and_std_dev(self.samples.iter().copied());
            self.noise_floor = mean;
            self.std_dev = std_dev.unwrap_or(FALLBACK_STD_DEV);
        } else {
            self.noise_floor = FALLBACK_NOISE_FLOOR;
            self.std_dev = FALLBACK_STD_DEV;
        }

        self.calibrating = false;
        self.calibration_complete = true;

        info!(
            noise_floor = self.noise_floor,
            std_dev = self.std_dev,
            threshold = self.current_threshold(),
            samples = self.samples.len(),
            "noise calibration complete"
        );

        AnalyzerEvent::CalibrationComplete(self.noise_profile())
    }

    fn recalibrate_from_recent_silence(&mut self, timestamp: u64) -> Option<AnalyzerEvent> {
        let take = self.samples.len().min(RECAL_WINDOW);
        if take == 0 {
            return None;
        }
        let skip = self.samples.len() - take;
        let (recent_mean, recent_std_dev) =
            mean_and_std_dev(self.samples.iter().skip(skip).copied());

        let old_floor = self.noise_floor;
        let alpha = self.config.smoothing_factor;
        self.noise_floor = old_floor * (1.0 - alpha) + recent_mean * alpha;
        if let Some(std_dev) = recent_std_dev {
            self.std_dev = std_dev;
        }
        self.last_calibration_time = timestamp;

        debug!(
            old_floor,
            new_floor = self.noise_floor,
            std_dev = self.std_dev,
            "recalibrated from recent silence"
        );

        self.adjust_sensitivity_factor()
    }

    fn adjust_sensitivity_factor(&mut self) -> Option<AnalyzerEvent> {
        let candidate = if self.std_dev < STABLE_STD_DEV {
            (self.sensitivity_factor * 1.1).min(MAX_SENSITIVITY_FACTOR)
        } else if self.std_dev > VOLATILE_STD_DEV {
            (self.sensitivity_factor * 0.9).max(MIN_SENSITIVITY_FACTOR)
        } else {
            return None;
        };

        if (candidate - self.sensitivity_factor).abs() <= SENSITIVITY_HYSTERESIS {
            return None;
        }

        self.sensitivity_factor = candidate;
        let threshold = self.current_threshold();
        info!(
            sensitivity_factor = candidate,
            threshold, "adjusted sensitivity factor"
        );
        Some(AnalyzerEvent::ThresholdChanged {
            threshold,
            sensitivity_factor: candidate,
        })
    }

    fn result(
        &self,
        level: f32,
        threshold: f32,
        timestamp: u64,
        event: Option<AnalyzerEvent>,
    ) -> LevelResult {
        LevelResult {
            level,
            threshold,
            is_speech: self.is_speech,
            profile: self.noise_profile(),
            timestamp,
            event,
        }
    }

    fn recent(&self, n: usize) -> Vec<f32> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).copied().collect()
    }
}

/// Mean and sample standard deviation (`None` for fewer than two values).
fn mean_and_std_dev(values: impl Iterator<Item = f32> + Clone) -> (f32, Option<f32>) {
    let n = values.clone().count();
    if n == 0 {
        return (0.0, None);
    }
    let mean = values.clone().map(f64::from).sum::<f64>() / n as f64;
    if n < 2 {
        return (mean as f32, None);
    }
    let var = values.map(|v| (f64::from(v) - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    (mean as f32, Some(var.sqrt() as f32))
}
