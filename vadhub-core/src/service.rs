//! Dispatch of client messages to the registry and the legacy analyzer.
//!
//! `VadService::handle` is safe to call concurrently from any number of
//! transport tasks. Every failure becomes an `error` event; nothing a client
//! sends can take the process down.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{Result, VadError};
use crate::ipc::events::{DebugState, VadEvent};
use crate::ipc::messages::{require_session_id, ClientMessage};
use crate::session::{RegistryStats, SessionRegistry};
use crate::vad::noise_floor::{AnalyzerConfig, NoiseFloorAnalyzer};

pub struct VadService {
    registry: Arc<SessionRegistry>,
    /// Process-wide analyzer answering `{level}` chunks and id-less requests.
    legacy: Mutex<NoiseFloorAnalyzer>,
    clock: Arc<dyn Clock>,
}

impl VadService {
    pub fn new(registry: Arc<SessionRegistry>, legacy_config: AnalyzerConfig) -> Self {
        let clock = Arc::clone(registry.clock());
        let legacy = NoiseFloorAnalyzer::new(legacy_config, clock.now_ms());
        Self {
            registry,
            legacy: Mutex::new(legacy),
            clock,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Handle one inbound message. `None` means nothing is sent back.
    pub fn handle(&self, message: ClientMessage) -> Option<VadEvent> {
        let result = match message {
            ClientMessage::InitSession { session_id } => {
                Ok(Some(self.init_session(session_id.as_deref())))
            }
            ClientMessage::AudioChunk {
                session_id,
                audio,
                level,
            } => self
                .audio_chunk(session_id.as_deref(), audio.as_deref(), level)
                .map(Some),
            ClientMessage::ForceRecalibration { session_id } => {
                self.force_recalibration(session_id.as_deref()).map(Some)
            }
            ClientMessage::UpdateVadConfig { session_id, config } => {
                require_session_id(session_id.as_deref()).and_then(|id| {
                    let patch = config.ok_or(VadError::MissingField("config"))?;
                    let (_, config) = self.registry.update_config(id, &patch)?;
                    Ok(Some(VadEvent::ConfigUpdated {
                        session_id: id.to_owned(),
                        config,
                    }))
                })
            }
            ClientMessage::GetDebugState { session_id } => {
                self.debug_state(session_id.as_deref()).map(Some)
            }
            ClientMessage::Disconnect { session_id } => {
                require_session_id(session_id.as_deref()).map(|id| {
                    self.registry.remove(id);
                    None
                })
            }
        };

        result.unwrap_or_else(|e| {
            warn!("request failed: {e}");
            Some(VadEvent::from(e))
        })
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn init_session(&self, session_id: Option<&str>) -> VadEvent {
        let (session_id, slot) = self.registry.get_or_create(session_id);
        let session = slot.lock();
        info!(session = %session_id, "VAD session initialized");
        VadEvent::VadInitialized {
            noise_profile: session.noise_profile(),
            config: session.config().clone(),
            session_id,
        }
    }

    fn audio_chunk(
        &self,
        session_id: Option<&str>,
        audio: Option<&str>,
        level: Option<f32>,
    ) -> Result<VadEvent> {
        let id = require_session_id(session_id)?;
        match (audio.filter(|a| !a.is_empty()), level) {
            (Some(audio), _) => Ok(self.registry.process(id, audio)?.event),
            (None, Some(level)) => {
                let now = self.clock.now_ms();
                if let Some(slot) = self.registry.get(id) {
                    slot.touch(now);
                }
                let result = self.legacy.lock().add_sample(level, now);
                Ok(VadEvent::VadResult(result))
            }
            (None, None) => Err(VadError::MissingField("audio")),
        }
    }

    fn force_recalibration(&self, session_id: Option<&str>) -> Result<VadEvent> {
        let now = self.clock.now_ms();
        match session_id.filter(|id| !id.is_empty()) {
            None => {
                let mut legacy = self.legacy.lock();
                legacy.force_recalibration(now);
                Ok(VadEvent::RecalibrationComplete {
                    threshold: legacy.current_threshold(),
                })
            }
            Some(id) => {
                self.registry.force_recalibration(id)?;
                Ok(VadEvent::RecalibrationStarted {
                    session_id: id.to_owned(),
                    timestamp: now,
                })
            }
        }
    }

    fn debug_state(&self, session_id: Option<&str>) -> Result<VadEvent> {
        let state = match session_id.filter(|id| !id.is_empty()) {
            None => DebugState {
                session: None,
                analyzer: self.legacy.lock().debug_state(),
            },
            Some(id) => DebugState {
                session: Some(self.registry.debug_state(id)?),
                analyzer: None,
            },
        };
        Ok(VadEvent::DebugState(state))
    }
}
