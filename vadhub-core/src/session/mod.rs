//! One client's VAD context and its chunk-level speech state machine.
//!
//! A chunk is split into full frames (a trailing partial frame is dropped),
//! every frame goes through the session's `FrameEnsemble`, and the fraction of
//! speech frames drives a two-state machine:
//!
//! | State      | `speechRatio > 0.5` | `speechRatio <= 0.5` |
//! |------------|---------------------|----------------------|
//! | `Silent`   | → `Speaking`, `speechStart` | `vadUpdate` |
//! | `Speaking` | `vadUpdate`         | → `Silent`, `speechEnd` |
//!
//! A chunk with no full frames never transitions. This machine is the only
//! source of `speechStart` / `speechEnd`; the noise analyzer's own debounced
//! verdict is used solely as the RMS vote inside the ensemble.

pub mod registry;

pub use registry::{RegistryOptions, RegistryStats, SessionHandle, SessionRegistry, SweeperHandle};

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use serde::Serialize;
use tracing::{debug, info};

use crate::audio::PcmChunk;
use crate::config::{ConfigChanges, VadConfig, VadConfigPatch};
use crate::error::Result;
use crate::ipc::events::VadEvent;
use crate::vad::neural::NeuralStatsSnapshot;
use crate::vad::noise_floor::{AnalyzerConfig, AnalyzerDebug, AnalyzerEvent, NoiseProfile};
use crate::vad::{AudioFrame, Classifiers, FrameEnsemble};

/// Frames retained per session.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
const DEBUG_RECENT_FRAMES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SpeechState {
    Silent,
    Speaking,
}

/// Outcome of one processed chunk.
#[derive(Debug, Clone)]
pub struct ChunkReport {
    pub event: VadEvent,
    pub frames: usize,
    pub speech_frames: usize,
}

/// Verbose session snapshot for `debugState`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDebug {
    pub session_id: String,
    pub created_at: u64,
    pub last_activity: u64,
    pub is_speaking: bool,
    pub total_frames: u64,
    pub speech_frames: u64,
    pub speech_ratio: f64,
    /// Frame size in bytes.
    pub frame_size: usize,
    pub config: VadConfig,
    pub recent_frames: Vec<AudioFrame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_analysis: Option<AnalyzerDebug>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neural_vad: Option<NeuralStatsSnapshot>,
}

pub struct Session {
    id: String,
    created_at: u64,
    config: VadConfig,
    ensemble: FrameEnsemble,
    state: SpeechState,
    speech_started_at: u64,
    total_frames: u64,
    speech_frames: u64,
    history: HeapRb<AudioFrame>,
}

impl Session {
    pub fn new(
        id: String,
        mut config: VadConfig,
        analyzer: AnalyzerConfig,
        classifiers: &Classifiers,
        history_capacity: usize,
        now_ms: u64,
    ) -> Self {
        config.normalize();
        let ensemble = FrameEnsemble::new(&config, analyzer, classifiers, now_ms);
        Self {
            id,
            created_at: now_ms,
            config,
            ensemble,
            state: SpeechState::Silent,
            speech_started_at: 0,
            total_frames: 0,
            speech_frames: 0,
            history: HeapRb::new(history_capacity.max(1)),
        }
    }

    /// Decode a base64 PCM16 payload and process it.
    ///
    /// # Errors
    /// `VadError::Decode` for malformed base64; the session is left untouched.
    pub fn process_chunk(&mut self, payload: &str, now_ms: u64) -> Result<ChunkReport> {
        let chunk = PcmChunk::from_base64(payload)?;
        Ok(self.process_pcm(&chunk, now_ms))
    }

    /// Classify every full frame of `chunk` and advance the state machine.
    pub fn process_pcm(&mut self, chunk: &PcmChunk, now_ms: u64) -> ChunkReport {
        let frame_bytes = self.config.frame_bytes();
        let mut frames = 0usize;
        let mut speech_frames = 0usize;

        for raw in chunk.frames(frame_bytes) {
            let frame = self.ensemble.classify(raw, &self.config, now_ms);
            frames += 1;
            if frame.ensemble_decision {
                speech_frames += 1;
            }
            self.history.push_overwrite(frame);
        }

        self.total_frames += frames as u64;
        self.speech_frames += speech_frames as u64;

        let event = self.transition(frames, speech_frames, now_ms);
        debug!(
            session = %self.id,
            frames,
            speech_frames,
            event = event.name(),
            "chunk processed"
        );
        ChunkReport {
            event,
            frames,
            speech_frames,
        }
    }

    /// Merge `patch` into this session's config and rebuild affected state.
    pub fn update_config(&mut self, patch: &VadConfigPatch, now_ms: u64) -> ConfigChanges {
        let changes = self.config.apply(patch);

        if changes.aggressiveness {
            self.ensemble.set_aggressiveness(self.config.aggressiveness);
        }
        if changes.sample_rate {
            self.ensemble.reset_neural(self.config.sample_rate);
        }
        let analyzer = self.ensemble.analyzer_mut();
        if changes.sensitivity {
            analyzer.set_sensitivity_factor(self.config.initial_sensitivity_factor);
        }
        analyzer.set_debug(self.config.debug);
        if changes.recalibrate {
            analyzer.force_recalibration(now_ms);
        }

        info!(session = %self.id, ?changes, "session config updated");
        changes
    }

    /// Restart noise calibration for this session.
    pub fn force_recalibration(&mut self, now_ms: u64) -> AnalyzerEvent {
        info!(session = %self.id, "recalibration requested");
        self.ensemble.analyzer_mut().force_recalibration(now_ms)
    }

    pub fn noise_profile(&self) -> NoiseProfile {
        self.ensemble.analyzer().noise_profile()
    }

    pub fn debug_state(&self, last_activity: u64) -> SessionDebug {
        let len = self.history.occupied_len();
        SessionDebug {
            session_id: self.id.clone(),
            created_at: self.created_at,
            last_activity,
            is_speaking: self.is_speaking(),
            total_frames: self.total_frames,
            speech_frames: self.speech_frames,
            speech_ratio: self.speech_frames as f64 / self.total_frames.max(1) as f64,
            frame_size: self.config.frame_bytes(),
            config: self.config.clone(),
            recent_frames: self
                .history
                .iter()
                .skip(len.saturating_sub(DEBUG_RECENT_FRAMES))
                .cloned()
                .collect(),
            audio_analysis: self.ensemble.analyzer().debug_state(),
            neural_vad: self
                .ensemble
                .neural()
                .map(|model| model.stats(self.config.sample_rate)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    pub fn state(&self) -> SpeechState {
        self.state
    }

    pub fn is_speaking(&self) -> bool {
        self.state == SpeechState::Speaking
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn speech_frames(&self) -> u64 {
        self.speech_frames
    }

    /// Number of frames currently held in the history ring.
    pub fn history_len(&self) -> usize {
        self.history.occupied_len()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn transition(&mut self, frames: usize, speech_frames: usize, now_ms: u64) -> VadEvent {
        if frames > 0 {
            let ratio = speech_frames as f32 / frames as f32;
            match (self.state, ratio > 0.5) {
                (SpeechState::Silent, true) => {
                    self.state = SpeechState::Speaking;
                    self.speech_started_at = now_ms;
                    info!(session = %self.id, ratio, "speech started");
                    return VadEvent::SpeechStart {
                        timestamp: now_ms,
                        confidence: ratio,
                        session_id: self.id.clone(),
                    };
                }
                (SpeechState::Speaking, false) => {
                    self.state = SpeechState::Silent;
                    let duration_ms = now_ms.saturating_sub(self.speech_started_at);
                    info!(session = %self.id, duration_ms, "speech ended");
                    return VadEvent::SpeechEnd {
                        timestamp: now_ms,
                        duration_ms,
                        session_id: self.id.clone(),
                    };
                }
                _ => {}
            }
        }

        VadEvent::VadUpdate {
            is_speaking: self.is_speaking(),
            timestamp: now_ms,
            session_id: self.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use base64::Engine as _;

    use super::*;
    use crate::error::VadError;
    use crate::vad::bitstream::tests::{level_factory, tone};

    fn bitstream_only() -> VadConfig {
        VadConfig {
            use_rms_vad: false,
            use_neural_vad: false,
            ..VadConfig::default()
        }
    }

    fn session(config: VadConfig) -> Session {
        Session::new(
            "s1".into(),
            config,
            AnalyzerConfig::default(),
            &Classifiers::default().with_bitstream(level_factory()),
            DEFAULT_HISTORY_CAPACITY,
            0,
        )
    }

    /// `speech` voiced frames followed by `silence` zero frames, 30 ms at 16 kHz.
    fn chunk(speech: usize, silence: usize) -> PcmChunk {
        let voiced: Vec<u8> = tone(220.0, 0.3, 16_000, 480)
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let mut bytes = Vec::new();
        for _ in 0..speech {
            bytes.extend_from_slice(&voiced);
        }
        bytes.resize(bytes.len() + silence * 960, 0);
        PcmChunk::new(bytes)
    }

    #[test]
    fn majority_speech_chunk_starts_speech() {
        let mut s = session(bitstream_only());
        let report = s.process_pcm(&chunk(60, 40), 1_000);

        assert_eq!(report.frames, 100);
        assert_eq!(report.speech_frames, 60);
        match report.event {
            VadEvent::SpeechStart {
                confidence,
                timestamp,
                ref session_id,
            } => {
                assert_relative_eq!(confidence, 0.6, epsilon = 1e-6);
                assert_eq!(timestamp, 1_000);
                assert_eq!(session_id, "s1");
            }
            other => panic!("expected speechStart, got {other:?}"),
        }
        assert_eq!(s.state(), SpeechState::Speaking);
        assert_eq!(s.total_frames(), 100);
        assert_eq!(s.speech_frames(), 60);
    }

    #[test]
    fn half_speech_ends_speech_with_duration() {
        let mut s = session(bitstream_only());
        s.process_pcm(&chunk(3, 0), 1_000);
        assert!(s.is_speaking());

        // Still speaking: no second speechStart.
        let report = s.process_pcm(&chunk(3, 1), 1_500);
        assert!(matches!(
            report.event,
            VadEvent::VadUpdate {
                is_speaking: true,
                ..
            }
        ));

        let report = s.process_pcm(&chunk(2, 2), 2_300);
        match report.event {
            VadEvent::SpeechEnd { duration_ms, .. } => assert_eq!(duration_ms, 1_300),
            other => panic!("expected speechEnd, got {other:?}"),
        }
        assert_eq!(s.state(), SpeechState::Silent);
    }

    #[test]
    fn short_chunk_never_transitions() {
        let mut s = session(bitstream_only());
        let report = s.process_pcm(&PcmChunk::new(vec![0u8; 500]), 1_000);
        assert_eq!(report.frames, 0);
        assert!(matches!(
            report.event,
            VadEvent::VadUpdate {
                is_speaking: false,
                ..
            }
        ));
        assert_eq!(s.total_frames(), 0);
    }

    #[test]
    fn trailing_partial_frame_is_dropped() {
        let mut s = session(bitstream_only());
        let mut bytes = chunk(2, 0).into_bytes();
        bytes.extend_from_slice(&[0u8; 100]);
        let report = s.process_pcm(&PcmChunk::new(bytes), 1_000);
        assert_eq!(report.frames, 2);
    }

    #[test]
    fn sub_sample_frame_size_classifies_nothing() {
        let mut s = session(bitstream_only());
        s.update_config(
            &VadConfigPatch {
                sample_rate: Some(1),
                ..Default::default()
            },
            0,
        );
        assert_eq!(s.config().frame_bytes(), 0);
        let report = s.process_pcm(&chunk(2, 0), 1_000);
        assert_eq!(report.frames, 0);
        assert_eq!(s.total_frames(), 0);
        assert_eq!(s.history_len(), 0);
    }

    #[test]
    fn malformed_base64_leaves_session_untouched() {
        let mut s = session(bitstream_only());
        let err = s.process_chunk("not base64!!", 1_000).unwrap_err();
        assert!(matches!(err, VadError::Decode(_)));
        assert_eq!(s.total_frames(), 0);
        assert_eq!(s.history_len(), 0);
    }

    #[test]
    fn base64_payload_is_processed() {
        let mut s = session(bitstream_only());
        let payload = base64::engine::general_purpose::STANDARD.encode(chunk(4, 0).as_bytes());
        let report = s.process_chunk(&payload, 1_000).expect("process chunk");
        assert_eq!(report.frames, 4);
        assert!(matches!(report.event, VadEvent::SpeechStart { .. }));
    }

    #[test]
    fn history_is_bounded_and_keeps_newest() {
        let mut s = session(bitstream_only());
        s.process_pcm(&chunk(0, 150), 1_000);
        assert_eq!(s.history_len(), DEFAULT_HISTORY_CAPACITY);
        s.process_pcm(&chunk(1, 0), 2_000);

        let debug = s.debug_state(2_000);
        assert_eq!(debug.recent_frames.len(), DEBUG_RECENT_FRAMES);
        let newest = debug.recent_frames.last().expect("newest frame");
        assert_eq!(newest.timestamp, 2_000);
        assert!(newest.ensemble_decision);
        assert_eq!(debug.total_frames, 151);
    }

    #[test]
    fn aggressiveness_update_changes_classification() {
        let mut config = bitstream_only();
        config.aggressiveness = 0;
        let mut s = session(config);
        let quiet: Vec<u8> = tone(220.0, 0.0112, 16_000, 480)
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();

        let report = s.process_pcm(&PcmChunk::new(quiet.clone()), 1_000);
        assert_eq!(report.speech_frames, 1);

        let changes = s.update_config(
            &VadConfigPatch {
                aggressiveness: Some(3),
                ..Default::default()
            },
            1_100,
        );
        assert!(changes.aggressiveness);

        let report = s.process_pcm(&PcmChunk::new(quiet), 1_200);
        assert_eq!(report.speech_frames, 0);
        assert!(matches!(report.event, VadEvent::SpeechEnd { .. }));
    }

    #[test]
    fn frame_duration_update_changes_frame_size() {
        let mut s = session(bitstream_only());
        s.update_config(
            &VadConfigPatch {
                frame_duration_ms: Some(10),
                ..Default::default()
            },
            0,
        );
        let report = s.process_pcm(&PcmChunk::new(vec![0u8; 960]), 1_000);
        assert_eq!(report.frames, 3);
    }

    #[test]
    fn recalibrate_patch_restarts_calibration() {
        let mut s = session(VadConfig::default());
        s.process_pcm(&chunk(0, 100), 2_500);
        assert!(s.noise_profile().calibration_complete);

        let changes = s.update_config(
            &VadConfigPatch {
                recalibrate: Some(true),
                ..Default::default()
            },
            3_000,
        );
        assert!(changes.recalibrate);
        assert!(!s.noise_profile().calibration_complete);
    }

    #[test]
    fn debug_output_includes_analyzer_only_when_enabled() {
        let mut s = session(VadConfig::default());
        assert!(s.debug_state(0).audio_analysis.is_none());
        s.update_config(
            &VadConfigPatch {
                debug: Some(true),
                ..Default::default()
            },
            0,
        );
        let debug = s.debug_state(0);
        assert!(debug.audio_analysis.is_some());
        assert!(debug.neural_vad.is_none());
    }
}
