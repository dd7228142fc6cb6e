//! Events emitted back to clients.
//!
//! Each event serialises as one JSON object whose `event` field names the
//! kind, for example `{"event":"speechStart","timestamp":…,"confidence":0.6,
//! "sessionId":"…"}`. The set of kinds is closed; there is no string-keyed
//! listener table.

use serde::Serialize;

use crate::config::VadConfig;
use crate::session::SessionDebug;
use crate::vad::noise_floor::{AnalyzerDebug, LevelResult, NoiseProfile};

// ---------------------------------------------------------------------------
// Outbound events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum VadEvent {
    /// Reply to `initSession`.
    VadInitialized {
        session_id: String,
        noise_profile: NoiseProfile,
        config: VadConfig,
    },
    /// Reply to a legacy `{level}` chunk, straight from the noise analyzer.
    VadResult(LevelResult),
    /// Chunk processed without a speech transition.
    VadUpdate {
        is_speaking: bool,
        timestamp: u64,
        session_id: String,
    },
    SpeechStart {
        timestamp: u64,
        /// Fraction of speech frames in the triggering chunk.
        confidence: f32,
        session_id: String,
    },
    SpeechEnd {
        timestamp: u64,
        duration_ms: u64,
        session_id: String,
    },
    Error {
        message: String,
    },
    DebugState(DebugState),
    ConfigUpdated {
        session_id: String,
        config: VadConfig,
    },
    RecalibrationStarted {
        session_id: String,
        timestamp: u64,
    },
    /// Reply to `forceRecalibration` without a session id.
    RecalibrationComplete {
        threshold: f32,
    },
}

impl VadEvent {
    pub fn error(message: impl Into<String>) -> Self {
        VadEvent::Error {
            message: message.into(),
        }
    }

    /// Wire name of this event kind.
    pub fn name(&self) -> &'static str {
        match self {
            VadEvent::VadInitialized { .. } => "vadInitialized",
            VadEvent::VadResult(_) => "vadResult",
            VadEvent::VadUpdate { .. } => "vadUpdate",
            VadEvent::SpeechStart { .. } => "speechStart",
            VadEvent::SpeechEnd { .. } => "speechEnd",
            VadEvent::Error { .. } => "error",
            VadEvent::DebugState(_) => "debugState",
            VadEvent::ConfigUpdated { .. } => "configUpdated",
            VadEvent::RecalibrationStarted { .. } => "recalibrationStarted",
            VadEvent::RecalibrationComplete { .. } => "recalibrationComplete",
        }
    }
}

impl From<crate::error::VadError> for VadEvent {
    fn from(err: crate::error::VadError) -> Self {
        VadEvent::error(err.to_string())
    }
}

/// Payload of `debugState`: a session snapshot, or the legacy analyzer's.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionDebug>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<AnalyzerDebug>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VadError;

    #[test]
    fn speech_start_serializes_tagged_camel_case() {
        let event = VadEvent::SpeechStart {
            timestamp: 1_000,
            confidence: 0.75,
            session_id: "abc".into(),
        };
        let json = serde_json::to_value(&event).expect("serialize speech start");
        assert_eq!(json["event"], "speechStart");
        assert_eq!(json["timestamp"], 1_000);
        assert_eq!(json["confidence"], 0.75);
        assert_eq!(json["sessionId"], "abc");
        assert_eq!(event.name(), "speechStart");
    }

    #[test]
    fn speech_end_carries_duration() {
        let event = VadEvent::SpeechEnd {
            timestamp: 5_000,
            duration_ms: 1_200,
            session_id: "abc".into(),
        };
        let json = serde_json::to_value(&event).expect("serialize speech end");
        assert_eq!(json["event"], "speechEnd");
        assert_eq!(json["durationMs"], 1_200);
    }

    #[test]
    fn errors_become_error_events() {
        let event = VadEvent::from(VadError::SessionNotFound("gone".into()));
        let json = serde_json::to_value(&event).expect("serialize error");
        assert_eq!(json["event"], "error");
        assert_eq!(json["message"], "session gone not found");
    }

    #[test]
    fn empty_debug_state_has_only_the_tag() {
        let json = serde_json::to_value(VadEvent::DebugState(DebugState::default()))
            .expect("serialize debug state");
        assert_eq!(json, serde_json::json!({ "event": "debugState" }));
    }

    #[test]
    fn initialized_embeds_config() {
        let event = VadEvent::VadInitialized {
            session_id: "s1".into(),
            noise_profile: crate::vad::NoiseFloorAnalyzer::new(Default::default(), 0)
                .noise_profile(),
            config: VadConfig::default(),
        };
        let json = serde_json::to_value(&event).expect("serialize initialized");
        assert_eq!(json["event"], "vadInitialized");
        assert_eq!(json["config"]["sampleRate"], 16_000);
        assert_eq!(json["noiseProfile"]["calibrationComplete"], false);
    }
}
