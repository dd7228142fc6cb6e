//! Per-frame weighted fusion of the three VAD judgments.
//!
//! Classifier failures never leave this module: a bitstream error or a
//! neural window that is still buffering (or failed) simply votes `false`.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use super::bitstream::{default_factory, BitstreamClassifier, BitstreamFactory};
use super::neural::{default_window, NeuralModelHandle, NeuralVote, NeuralWindowBuffer};
use super::noise_floor::{AnalyzerConfig, NoiseFloorAnalyzer};
use crate::audio::pcm::{normalized_rms, pcm16_samples, pcm16_to_f32};
use crate::config::VadConfig;

/// Per-classifier verdicts for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameVotes {
    pub rms: bool,
    pub bitstream: bool,
    pub neural: bool,
}

/// One classified frame. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFrame {
    #[serde(skip)]
    pub raw_bytes: Vec<u8>,
    pub rms_level: f32,
    pub votes: FrameVotes,
    pub neural_confidence: f32,
    pub neural_buffering: bool,
    pub ensemble_decision: bool,
    pub ensemble_score: f32,
    pub timestamp: u64,
}

/// Shared classifier backends handed to every new session.
#[derive(Clone)]
pub struct Classifiers {
    pub bitstream: BitstreamFactory,
    pub neural: Option<NeuralModelHandle>,
}

impl Classifiers {
    pub fn new(neural: Option<NeuralModelHandle>) -> Self {
        Self {
            bitstream: default_factory(),
            neural,
        }
    }

    pub fn with_bitstream(mut self, factory: BitstreamFactory) -> Self {
        self.bitstream = factory;
        self
    }
}

impl Default for Classifiers {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for Classifiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifiers")
            .field("neural", &self.neural)
            .finish_non_exhaustive()
    }
}

/// Per-session classifier state: analyzer, bitstream instance, neural buffer.
pub struct FrameEnsemble {
    analyzer: NoiseFloorAnalyzer,
    bitstream: Box<dyn BitstreamClassifier>,
    factory: BitstreamFactory,
    neural: Option<NeuralModelHandle>,
    neural_buffer: NeuralWindowBuffer,
}

impl FrameEnsemble {
    pub fn new(
        config: &VadConfig,
        mut analyzer_config: AnalyzerConfig,
        classifiers: &Classifiers,
        now_ms: u64,
    ) -> Self {
        analyzer_config.initial_sensitivity_factor = config.initial_sensitivity_factor;
        let mut analyzer = NoiseFloorAnalyzer::new(analyzer_config, now_ms);
        analyzer.set_debug(config.debug);

        let required = window_for(classifiers.neural.as_ref(), config.sample_rate);
        Self {
            analyzer,
            bitstream: (classifiers.bitstream)(config.aggressiveness),
            factory: Arc::clone(&classifiers.bitstream),
            neural: classifiers.neural.clone(),
            neural_buffer: NeuralWindowBuffer::new(required),
        }
    }

    /// Classify one PCM16 frame of `config.frame_bytes()` bytes.
    pub fn classify(&mut self, frame: &[u8], config: &VadConfig, timestamp: u64) -> AudioFrame {
        let samples = pcm16_samples(frame);
        let rms_level = normalized_rms(&samples);
        let rms = self.analyzer.add_sample(rms_level, timestamp).is_speech;

        let bitstream = config.use_bitstream_vad
            && match self.bitstream.classify(&samples, config.sample_rate) {
                Ok(decision) => decision.is_speech(),
                Err(e) => {
                    warn!("bitstream VAD rejected frame: {e}");
                    false
                }
            };

        let neural_vote = match (&self.neural, config.use_neural_vad) {
            (Some(model), true) => self.neural_buffer.push_and_classify(
                &pcm16_to_f32(&samples),
                model,
                config.sample_rate,
            ),
            _ => NeuralVote::Failed,
        };

        let votes = FrameVotes {
            rms,
            bitstream,
            neural: neural_vote.is_speech(),
        };
        let (ensemble_decision, ensemble_score) = fuse(&votes, config);

        AudioFrame {
            raw_bytes: frame.to_vec(),
            rms_level,
            votes,
            neural_confidence: neural_vote.confidence(),
            neural_buffering: matches!(neural_vote, NeuralVote::Buffering { .. }),
            ensemble_decision,
            ensemble_score,
            timestamp,
        }
    }

    /// Rebuild the bitstream classifier for a new aggressiveness mode.
    pub fn set_aggressiveness(&mut self, aggressiveness: u8) {
        self.bitstream = (self.factory)(aggressiveness);
    }

    /// Drop buffered neural audio and recompute the window for `sample_rate`.
    pub fn reset_neural(&mut self, sample_rate: u32) {
        let required = window_for(self.neural.as_ref(), sample_rate);
        self.neural_buffer.reset(required);
    }

    pub fn neural(&self) -> Option<&NeuralModelHandle> {
        self.neural.as_ref()
    }

    pub fn neural_buffered(&self) -> usize {
        self.neural_buffer.len()
    }

    pub fn neural_window(&self) -> usize {
        self.neural_buffer.required()
    }

    pub fn analyzer(&self) -> &NoiseFloorAnalyzer {
        &self.analyzer
    }

    pub fn analyzer_mut(&mut self) -> &mut NoiseFloorAnalyzer {
        &mut self.analyzer
    }
}

/// Weighted score over enabled classifiers; RMS alone when none is enabled.
pub fn fuse(votes: &FrameVotes, config: &VadConfig) -> (bool, f32) {
    let mut weighted = 0.0f32;
    let mut total = 0.0f32;
    for (enabled, vote, weight) in [
        (config.use_rms_vad, votes.rms, config.rms_weight),
        (config.use_bitstream_vad, votes.bitstream, config.bitstream_weight),
        (config.use_neural_vad, votes.neural, config.neural_weight),
    ] {
        if enabled {
            total += weight;
            if vote {
                weighted += weight;
            }
        }
    }

    if total <= 0.0 {
        return (votes.rms, if votes.rms { 1.0 } else { 0.0 });
    }
    let score = weighted / total;
    (score > 0.5, score)
}

fn window_for(model: Option<&NeuralModelHandle>, sample_rate: u32) -> usize {
    model
        .map(|m| m.required_samples(sample_rate))
        .unwrap_or_else(|| default_window(sample_rate))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::vad::bitstream::tests::{level_factory, tone};
    use crate::vad::neural::tests::FixedModel;
    use crate::vad::neural::NeuralConfig;

    fn to_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn bitstream_only() -> VadConfig {
        VadConfig {
            use_rms_vad: false,
            use_neural_vad: false,
            ..VadConfig::default()
        }
    }

    #[test]
    fn weighted_vote_matches_reference_case() {
        let votes = FrameVotes {
            rms: true,
            bitstream: false,
            neural: true,
        };
        let (decision, score) = fuse(&votes, &VadConfig::default());
        assert_relative_eq!(score, 0.6, epsilon = 1e-6);
        assert!(decision);
    }

    #[test]
    fn disabled_classifiers_do_not_count() {
        let votes = FrameVotes {
            rms: false,
            bitstream: true,
            neural: false,
        };
        let (decision, score) = fuse(&votes, &bitstream_only());
        assert!(decision);
        assert_relative_eq!(score, 1.0);
    }

    #[test]
    fn exactly_half_is_not_speech() {
        let config = VadConfig {
            rms_weight: 0.5,
            bitstream_weight: 0.5,
            use_neural_vad: false,
            ..VadConfig::default()
        };
        let votes = FrameVotes {
            rms: true,
            bitstream: false,
            neural: false,
        };
        let (decision, score) = fuse(&votes, &config);
        assert_relative_eq!(score, 0.5);
        assert!(!decision);
    }

    #[test]
    fn nothing_enabled_falls_back_to_rms() {
        let config = VadConfig {
            use_rms_vad: false,
            use_bitstream_vad: false,
            use_neural_vad: false,
            ..VadConfig::default()
        };
        let speaking = FrameVotes {
            rms: true,
            ..FrameVotes::default()
        };
        assert_eq!(fuse(&speaking, &config), (true, 1.0));
        assert_eq!(fuse(&FrameVotes::default(), &config), (false, 0.0));
    }

    #[test]
    fn bitstream_length_mismatch_votes_false() {
        let config = VadConfig {
            frame_duration_ms: 25,
            ..bitstream_only()
        };
        let classifiers = Classifiers::default().with_bitstream(level_factory());
        let mut ensemble = FrameEnsemble::new(&config, AnalyzerConfig::default(), &classifiers, 0);
        let frame = to_bytes(&tone(220.0, 0.3, 16_000, config.frame_samples()));
        let result = ensemble.classify(&frame, &config, 10);
        assert!(!result.votes.bitstream);
        assert!(!result.ensemble_decision);
    }

    #[test]
    fn aggressiveness_change_applies_to_next_frame() {
        let mut config = bitstream_only();
        config.aggressiveness = 0;
        let classifiers = Classifiers::default().with_bitstream(level_factory());
        let mut ensemble = FrameEnsemble::new(&config, AnalyzerConfig::default(), &classifiers, 0);
        let frame = to_bytes(&tone(220.0, 0.0112, 16_000, 480));

        assert!(ensemble.classify(&frame, &config, 10).ensemble_decision);

        config.aggressiveness = 3;
        ensemble.set_aggressiveness(3);
        assert!(!ensemble.classify(&frame, &config, 20).ensemble_decision);
    }

    #[test]
    fn neural_votes_after_buffering() {
        let config = VadConfig {
            use_rms_vad: false,
            use_bitstream_vad: false,
            ..VadConfig::default()
        };
        let handle = NeuralModelHandle::new(FixedModel::new(0.9), NeuralConfig::default());
        let classifiers = Classifiers::new(Some(handle));
        let mut ensemble = FrameEnsemble::new(&config, AnalyzerConfig::default(), &classifiers, 0);
        let frame = to_bytes(&tone(220.0, 0.3, 16_000, 480));

        let first = ensemble.classify(&frame, &config, 10);
        assert!(first.neural_buffering);
        assert!(!first.votes.neural);
        assert!(!first.ensemble_decision);

        let second = ensemble.classify(&frame, &config, 40);
        assert!(!second.neural_buffering);
        assert!(second.votes.neural);
        assert_relative_eq!(second.neural_confidence, 0.9, epsilon = 1e-6);
        assert!(second.ensemble_decision);
    }

    #[test]
    fn sample_rate_change_resizes_neural_window() {
        let config = VadConfig::default();
        let handle = NeuralModelHandle::new(FixedModel::new(0.1), NeuralConfig::default());
        let classifiers = Classifiers::new(Some(handle));
        let mut ensemble = FrameEnsemble::new(&config, AnalyzerConfig::default(), &classifiers, 0);
        assert_eq!(ensemble.neural_window(), 512);

        ensemble.classify(&[0u8; 960], &config, 10);
        assert_eq!(ensemble.neural_buffered(), 480);

        ensemble.reset_neural(8_000);
        assert_eq!(ensemble.neural_window(), 256);
        assert_eq!(ensemble.neural_buffered(), 0);
    }

    #[test]
    fn missing_model_votes_false() {
        let config = VadConfig {
            use_rms_vad: false,
            use_bitstream_vad: false,
            ..VadConfig::default()
        };
        let mut ensemble =
            FrameEnsemble::new(&config, AnalyzerConfig::default(), &Classifiers::default(), 0);
        let result = ensemble.classify(&[0u8; 960], &config, 10);
        assert!(!result.votes.neural);
        assert!(!result.neural_buffering);
        assert_eq!(result.ensemble_score, 0.0);
    }
}
