//! Neural speech-probability model contract and per-session window buffering.
//!
//! The model is loaded once at startup and shared by every session through a
//! `NeuralModelHandle`. Each session owns a `NeuralWindowBuffer`: incoming
//! frames rarely match the model's fixed window, so samples accumulate and
//! windows are taken every half window (50 % overlap) for as long as enough
//! audio is buffered. The frame's vote is the newest window's score.
//!
//! Recurrent model state lives in the buffer, not the model, so sessions never
//! see each other's context. All inference is serialised through the handle's
//! `parking_lot::Mutex`; the session registry never holds its own lock across
//! this call.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

/// Contract for neural speech-probability backends.
pub trait SpeechProbabilityModel: Send + 'static {
    /// Samples per inference window at `sample_rate`.
    fn required_samples(&self, sample_rate: u32) -> usize {
        default_window(sample_rate)
    }

    /// Speech probability in [0, 1] for exactly `required_samples` f32 samples.
    ///
    /// `state` belongs to one audio stream. It starts empty and the model
    /// sizes and updates it as it sees fit.
    ///
    /// # Errors
    /// Backend-specific inference failures.
    fn predict(
        &mut self,
        window: &[f32],
        sample_rate: u32,
        state: &mut RecurrentState,
    ) -> Result<f32>;
}

/// Per-stream recurrent context carried between windows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecurrentState {
    /// LSTM `h` or GRU state, flattened.
    pub hidden: Vec<f32>,
    /// LSTM `c`; empty otherwise.
    pub cell: Vec<f32>,
}

impl RecurrentState {
    pub fn is_fresh(&self) -> bool {
        self.hidden.is_empty() && self.cell.is_empty()
    }

    pub fn clear(&mut self) {
        self.hidden.clear();
        self.cell.clear();
    }
}

/// 512 samples (32 ms) at 16 kHz, 256 at any other rate.
pub fn default_window(sample_rate: u32) -> usize {
    if sample_rate == 16_000 {
        512
    } else {
        256
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct NeuralConfig {
    /// Confidence above which a window counts as speech.
    pub threshold: f32,
}

impl Default for NeuralConfig {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

#[derive(Default)]
struct NeuralStats {
    total_predictions: AtomicU64,
    positive_predictions: AtomicU64,
    total_inference_us: AtomicU64,
}

/// Read-only view of shared model statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NeuralStatsSnapshot {
    pub total_predictions: u64,
    pub positive_predictions: u64,
    /// Percentage of windows classified as speech.
    pub positive_rate: f64,
    pub avg_inference_time_ms: f64,
    pub load_time_ms: f64,
    pub threshold: f32,
    pub required_samples: usize,
}

/// Result of one model call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeuralScore {
    pub is_speech: bool,
    pub confidence: f32,
}

/// Thread-safe shared handle to the loaded model.
#[derive(Clone)]
pub struct NeuralModelHandle {
    model: Arc<Mutex<dyn SpeechProbabilityModel>>,
    stats: Arc<NeuralStats>,
    config: NeuralConfig,
    load_time_ms: f64,
}

impl NeuralModelHandle {
    /// Wrap any `SpeechProbabilityModel`.
    pub fn new<M: SpeechProbabilityModel>(model: M, config: NeuralConfig) -> Self {
        Self::with_load_time(model, config, 0.0)
    }

    /// Wrap a model and record how long it took to load.
    pub fn with_load_time<M: SpeechProbabilityModel>(
        model: M,
        config: NeuralConfig,
        load_time_ms: f64,
    ) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
            stats: Arc::new(NeuralStats::default()),
            config,
            load_time_ms,
        }
    }

    pub fn required_samples(&self, sample_rate: u32) -> usize {
        self.model.lock().required_samples(sample_rate)
    }

    pub fn threshold(&self) -> f32 {
        self.config.threshold
    }

    /// Run one window through the model and record statistics.
    pub fn infer(
        &self,
        window: &[f32],
        sample_rate: u32,
        state: &mut RecurrentState,
    ) -> Result<NeuralScore> {
        let started = Instant::now();
        let confidence = self.model.lock().predict(window, sample_rate, state)?;
        let elapsed_us = started.elapsed().as_micros() as u64;

        let is_speech = confidence > self.config.threshold;
        self.stats.total_predictions.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_inference_us
            .fetch_add(elapsed_us, Ordering::Relaxed);
        if is_speech {
            self.stats.positive_predictions.fetch_add(1, Ordering::Relaxed);
        }

        Ok(NeuralScore {
            is_speech,
            confidence,
        })
    }

    /// Statistics snapshot; `required_samples` is reported for `sample_rate`.
    pub fn stats(&self, sample_rate: u32) -> NeuralStatsSnapshot {
        let total = self.stats.total_predictions.load(Ordering::Relaxed);
        let positive = self.stats.positive_predictions.load(Ordering::Relaxed);
        let total_us = self.stats.total_inference_us.load(Ordering::Relaxed);
        NeuralStatsSnapshot {
            total_predictions: total,
            positive_predictions: positive,
            positive_rate: if total > 0 {
                positive as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            avg_inference_time_ms: if total > 0 {
                total_us as f64 / total as f64 / 1000.0
            } else {
                0.0
            },
            load_time_ms: self.load_time_ms,
            threshold: self.config.threshold,
            required_samples: self.required_samples(sample_rate),
        }
    }
}

impl std::fmt::Debug for NeuralModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeuralModelHandle")
            .field("threshold", &self.config.threshold)
            .finish_non_exhaustive()
    }
}

/// Neural vote for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NeuralVote {
    /// Not enough audio for a full window yet; no decision.
    Buffering { buffered: usize, required: usize },
    Scored(NeuralScore),
    /// No model loaded, or inference failed.
    Failed,
}

impl NeuralVote {
    pub fn is_speech(&self) -> bool {
        matches!(self, NeuralVote::Scored(score) if score.is_speech)
    }

    pub fn confidence(&self) -> f32 {
        match self {
            NeuralVote::Scored(score) => score.confidence,
            _ => 0.0,
        }
    }
}

/// Per-session sliding sample buffer feeding the shared model.
#[derive(Debug, Clone)]
pub struct NeuralWindowBuffer {
    samples: Vec<f32>,
    required: usize,
    state: RecurrentState,
}

impl NeuralWindowBuffer {
    pub fn new(required: usize) -> Self {
        let required = required.max(2);
        Self {
            samples: Vec::with_capacity(required * 2),
            required,
            state: RecurrentState::default(),
        }
    }

    /// Drop buffered audio and recurrent state; resize for a new window length.
    pub fn reset(&mut self, required: usize) {
        *self = Self::new(required);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn state(&self) -> &RecurrentState {
        &self.state
    }

    /// Append `frame` and classify every half-window-stepped window now available.
    ///
    /// The vote reflects the newest window. Inference failures are logged and
    /// reported as `NeuralVote::Failed`; they never propagate.
    pub fn push_and_classify(
        &mut self,
        frame: &[f32],
        model: &NeuralModelHandle,
        sample_rate: u32,
    ) -> NeuralVote {
        self.samples.extend_from_slice(frame);
        if self.samples.len() < self.required {
            return NeuralVote::Buffering {
                buffered: self.samples.len(),
                required: self.required,
            };
        }

        let step = self.required / 2;
        let mut start = 0;
        let mut vote = NeuralVote::Failed;
        while start + self.required <= self.samples.len() {
            let window = &self.samples[start..start + self.required];
            vote = match model.infer(window, sample_rate, &mut self.state) {
                Ok(score) => NeuralVote::Scored(score),
                Err(e) => {
                    warn!("neural VAD inference error: {e}");
                    NeuralVote::Failed
                }
            };
            start += step;
        }
        // Samples before `start` belong to no future window.
        self.samples.drain(..start);
        vote
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::VadError;

    /// Returns a fixed probability and records window lengths.
    pub(crate) struct FixedModel {
        pub prob: f32,
        pub windows: Arc<Mutex<Vec<usize>>>,
    }

    impl FixedModel {
        pub(crate) fn new(prob: f32) -> Self {
            Self {
                prob,
                windows: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl SpeechProbabilityModel for FixedModel {
        fn predict(
            &mut self,
            window: &[f32],
            _sample_rate: u32,
            _state: &mut RecurrentState,
        ) -> Result<f32> {
            self.windows.lock().push(window.len());
            Ok(self.prob)
        }
    }

    /// Records the first and last sample of every window it sees.
    struct SpanModel {
        spans: Arc<Mutex<Vec<(f32, f32)>>>,
    }

    impl SpeechProbabilityModel for SpanModel {
        fn predict(
            &mut self,
            window: &[f32],
            _sample_rate: u32,
            _state: &mut RecurrentState,
        ) -> Result<f32> {
            self.spans
                .lock()
                .push((window[0], window[window.len() - 1]));
            Ok(0.0)
        }
    }

    /// Counts windows per stream in `state.hidden[0]`; confidence is count / 10.
    struct CountingModel;

    impl SpeechProbabilityModel for CountingModel {
        fn predict(
            &mut self,
            _window: &[f32],
            _sample_rate: u32,
            state: &mut RecurrentState,
        ) -> Result<f32> {
            if state.is_fresh() {
                state.hidden = vec![0.0];
            }
            state.hidden[0] += 1.0;
            Ok(state.hidden[0] / 10.0)
        }
    }

    struct FailingModel;

    impl SpeechProbabilityModel for FailingModel {
        fn predict(
            &mut self,
            _window: &[f32],
            _sample_rate: u32,
            _state: &mut RecurrentState,
        ) -> Result<f32> {
            Err(VadError::Inference("boom".into()))
        }
    }

    #[test]
    fn required_window_depends_on_rate() {
        let handle = NeuralModelHandle::new(FixedModel::new(0.9), NeuralConfig::default());
        assert_eq!(handle.required_samples(16_000), 512);
        assert_eq!(handle.required_samples(8_000), 256);
    }

    #[test]
    fn buffers_until_a_full_window() {
        let handle = NeuralModelHandle::new(FixedModel::new(0.9), NeuralConfig::default());
        let mut buf = NeuralWindowBuffer::new(512);

        let vote = buf.push_and_classify(&[0.0; 300], &handle, 16_000);
        assert_eq!(
            vote,
            NeuralVote::Buffering {
                buffered: 300,
                required: 512
            }
        );

        let vote = buf.push_and_classify(&[0.0; 300], &handle, 16_000);
        assert!(vote.is_speech());
        assert!((vote.confidence() - 0.9).abs() < 1e-6);
        // 600 buffered, one window taken, advanced by half a window.
        assert_eq!(buf.len(), 600 - 256);
    }

    #[test]
    fn model_sees_exact_windows() {
        let model = FixedModel::new(0.2);
        let windows = Arc::clone(&model.windows);
        let handle = NeuralModelHandle::new(model, NeuralConfig::default());
        let mut buf = NeuralWindowBuffer::new(512);

        for _ in 0..10 {
            let vote = buf.push_and_classify(&[0.1; 480], &handle, 16_000);
            assert!(!vote.is_speech());
        }
        assert!(windows.lock().iter().all(|&len| len == 512));
    }

    #[test]
    fn steady_state_windows_overlap_by_half() {
        let spans = Arc::new(Mutex::new(Vec::new()));
        let handle = NeuralModelHandle::new(
            SpanModel {
                spans: Arc::clone(&spans),
            },
            NeuralConfig::default(),
        );
        let mut buf = NeuralWindowBuffer::new(512);

        // Sample value == absolute sample index.
        let mut pushed = 0usize;
        for _ in 0..20 {
            let frame: Vec<f32> = (pushed..pushed + 480).map(|i| i as f32).collect();
            pushed += 480;
            buf.push_and_classify(&frame, &handle, 16_000);

            // The newest window always ends within half a window of the newest sample.
            if let Some(&(_, last_end)) = spans.lock().last() {
                assert!(pushed - 1 - (last_end as usize) < 256, "lagging at {pushed}");
            }
        }

        let spans = spans.lock();
        assert_eq!(spans[0], (0.0, 511.0));
        for pair in spans.windows(2) {
            assert_eq!(pair[1].0 - pair[0].0, 256.0);
        }
        assert!(buf.len() < 512);
    }

    #[test]
    fn recurrent_state_is_per_buffer() {
        let handle = NeuralModelHandle::new(CountingModel, NeuralConfig::default());
        let mut a = NeuralWindowBuffer::new(256);
        let mut b = NeuralWindowBuffer::new(256);

        // One window on the first push, two (128-sample step) on each later one.
        for _ in 0..3 {
            a.push_and_classify(&[0.0; 256], &handle, 8_000);
        }
        assert_eq!(a.state().hidden, vec![5.0]);
        let vote = b.push_and_classify(&[0.0; 256], &handle, 8_000);
        assert!((vote.confidence() - 0.1).abs() < 1e-6);

        a.reset(256);
        assert!(a.state().is_fresh());
        let vote = a.push_and_classify(&[0.0; 256], &handle, 8_000);
        assert!((vote.confidence() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn inference_failure_is_contained() {
        let handle = NeuralModelHandle::new(FailingModel, NeuralConfig::default());
        let mut buf = NeuralWindowBuffer::new(256);
        let vote = buf.push_and_classify(&[0.0; 300], &handle, 8_000);
        assert_eq!(vote, NeuralVote::Failed);
        assert!(!vote.is_speech());
        assert_eq!(vote.confidence(), 0.0);
    }

    #[test]
    fn stats_track_positive_rate() {
        let handle = NeuralModelHandle::new(FixedModel::new(0.9), NeuralConfig::default());
        let mut state = RecurrentState::default();
        handle.infer(&[0.0; 512], 16_000, &mut state).unwrap();
        handle.infer(&[0.0; 512], 16_000, &mut state).unwrap();
        let stats = handle.stats(16_000);
        assert_eq!(stats.total_predictions, 2);
        assert_eq!(stats.positive_predictions, 2);
        assert_eq!(stats.positive_rate, 100.0);
        assert_eq!(stats.required_samples, 512);
    }
}
