//! Inbound client messages.
//!
//! Every field is optional at the serde level so a message with a missing
//! `sessionId` or `audio` still parses and can be answered with an `error`
//! event instead of a protocol failure.

use serde::Deserialize;

use crate::config::VadConfigPatch;
use crate::error::{Result, VadError};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    InitSession {
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Either `audio` (base64 PCM16) or legacy `level` is expected.
    AudioChunk {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        audio: Option<String>,
        #[serde(default)]
        level: Option<f32>,
    },
    ForceRecalibration {
        #[serde(default)]
        session_id: Option<String>,
    },
    UpdateVadConfig {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        config: Option<VadConfigPatch>,
    },
    GetDebugState {
        #[serde(default)]
        session_id: Option<String>,
    },
    Disconnect {
        #[serde(default)]
        session_id: Option<String>,
    },
}

impl ClientMessage {
    /// Parse one JSON message.
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| VadError::Decode(format!("bad message: {e}")))
    }
}

/// Non-empty session id, or `MissingField("sessionId")`.
pub fn require_session_id(id: Option<&str>) -> Result<&str> {
    id.filter(|id| !id.is_empty())
        .ok_or(VadError::MissingField("sessionId"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_chunk_parses_camel_case() {
        let msg = ClientMessage::parse(r#"{"type":"audioChunk","sessionId":"s1","audio":"AAA="}"#)
            .expect("parse audio chunk");
        assert_eq!(
            msg,
            ClientMessage::AudioChunk {
                session_id: Some("s1".into()),
                audio: Some("AAA=".into()),
                level: None,
            }
        );
    }

    #[test]
    fn missing_fields_still_parse() {
        let msg = ClientMessage::parse(r#"{"type":"updateVadConfig"}"#).expect("parse");
        assert_eq!(
            msg,
            ClientMessage::UpdateVadConfig {
                session_id: None,
                config: None,
            }
        );
    }

    #[test]
    fn config_patch_is_partial() {
        let msg = ClientMessage::parse(
            r#"{"type":"updateVadConfig","sessionId":"s1","config":{"aggressiveness":3}}"#,
        )
        .expect("parse");
        let ClientMessage::UpdateVadConfig { config, .. } = msg else {
            panic!("wrong variant");
        };
        let patch = config.expect("patch present");
        assert_eq!(patch.aggressiveness, Some(3));
        assert_eq!(patch.sample_rate, None);
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        let err = ClientMessage::parse(r#"{"type":"teleport"}"#).unwrap_err();
        assert!(matches!(err, VadError::Decode(_)));
    }

    #[test]
    fn empty_session_id_is_missing() {
        assert!(matches!(
            require_session_id(Some("")),
            Err(VadError::MissingField("sessionId"))
        ));
        assert_eq!(require_session_id(Some("x")).unwrap(), "x");
    }
}
