//! Concurrent session map with idle expiry.
//!
//! ## Locking
//!
//! - The map is a `parking_lot::RwLock<HashMap<String, Arc<SessionSlot>>>`.
//!   It is held only for lookup, insert and remove; callers clone the `Arc`
//!   and release the map before touching the session.
//! - Each slot wraps its `Session` in a `Mutex`, so chunks for one session are
//!   serialised while different sessions run in parallel. Neural inference
//!   happens under the session lock only, never the map lock.
//! - `last_activity` and the session timeout are atomics on the slot, so the
//!   expiry sweep never waits on a session that is mid-chunk.
//!
//! A session removed while a chunk is in flight finishes that chunk on its
//! own `Arc`; new lookups can no longer reach it.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{ChunkReport, Session, SessionDebug, DEFAULT_HISTORY_CAPACITY};
use crate::audio::PcmChunk;
use crate::clock::Clock;
use crate::config::{ConfigChanges, VadConfig, VadConfigPatch};
use crate::error::{Result, VadError};
use crate::vad::neural::NeuralStatsSnapshot;
use crate::vad::noise_floor::{AnalyzerConfig, AnalyzerEvent};
use crate::vad::Classifiers;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub type SessionHandle = Arc<SessionSlot>;

/// A registered session plus the bookkeeping the sweep reads lock-free.
pub struct SessionSlot {
    session: Mutex<Session>,
    last_activity: AtomicU64,
    timeout_ms: AtomicU64,
}

impl SessionSlot {
    fn new(session: Session, now_ms: u64) -> Self {
        let timeout_ms = session.config().session_timeout_ms;
        Self {
            session: Mutex::new(session),
            last_activity: AtomicU64::new(now_ms),
            timeout_ms: AtomicU64::new(timeout_ms),
        }
    }

    /// Exclusive access to the session for one processing call.
    pub fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock()
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_activity.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_activity()) > self.timeout_ms.load(Ordering::Relaxed)
    }

    fn sync_timeout(&self, timeout_ms: u64) {
        self.timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }
}

/// Defaults applied to every new session.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub defaults: VadConfig,
    pub analyzer: AnalyzerConfig,
    pub history_capacity: usize,
    pub sweep_interval: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            defaults: VadConfig::default(),
            analyzer: AnalyzerConfig::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Aggregate, read-only view across all sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub total_frames_processed: u64,
    pub speech_frames_detected: u64,
    pub speech_ratio: f64,
    pub neural_vad_stats: Option<NeuralStatsSnapshot>,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    options: RegistryOptions,
    classifiers: Classifiers,
    clock: Arc<dyn Clock>,
    frames_processed: AtomicU64,
    speech_frames_detected: AtomicU64,
}

impl SessionRegistry {
    pub fn new(options: RegistryOptions, classifiers: Classifiers, clock: Arc<dyn Clock>) -> Self {
        let mut options = options;
        options.defaults.normalize();
        options.analyzer.normalize();
        Self {
            sessions: RwLock::new(HashMap::new()),
            options,
            classifiers,
            clock,
            frames_processed: AtomicU64::new(0),
            speech_frames_detected: AtomicU64::new(0),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Return the live session for `id`, or register a new one.
    ///
    /// A missing or empty `id` gets a fresh UUID. An expired session under the
    /// same id is replaced by a new one with zeroed counters.
    pub fn get_or_create(&self, id: Option<&str>) -> (String, SessionHandle) {
        let id = id.filter(|id| !id.is_empty());
        let now = self.clock.now_ms();

        if let Some(id) = id {
            if let Some(slot) = self.live(id, now) {
                return (id.to_owned(), slot);
            }
        }

        let id = id
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        // Built outside the map lock: construction may consult the shared model.
        let fresh = Arc::new(SessionSlot::new(self.build_session(id.clone(), now), now));

        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&id) {
            if !existing.is_expired(now) {
                existing.touch(now);
                return (id, Arc::clone(existing));
            }
            info!(session = %id, "replacing expired session");
        }
        sessions.insert(id.clone(), Arc::clone(&fresh));
        info!(session = %id, active = sessions.len(), "session created");
        (id, fresh)
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().get(id).cloned()
    }

    /// Decode and process one base64 PCM16 chunk for `id`.
    ///
    /// # Errors
    /// `SessionNotFound` if `id` is not registered, `Decode` for bad payloads.
    pub fn process(&self, id: &str, payload: &str) -> Result<ChunkReport> {
        let slot = self.require(id)?;
        // A payload that fails to decode leaves the session untouched.
        let chunk = PcmChunk::from_base64(payload)?;
        let now = self.clock.now_ms();
        slot.touch(now);

        let report = slot.lock().process_pcm(&chunk, now);
        self.frames_processed
            .fetch_add(report.frames as u64, Ordering::Relaxed);
        self.speech_frames_detected
            .fetch_add(report.speech_frames as u64, Ordering::Relaxed);
        Ok(report)
    }

    /// Merge `patch` into one session's config.
    pub fn update_config(
        &self,
        id: &str,
        patch: &VadConfigPatch,
    ) -> Result<(ConfigChanges, VadConfig)> {
        let slot = self.require(id)?;
        let now = self.clock.now_ms();
        slot.touch(now);

        let mut session = slot.lock();
        let changes = session.update_config(patch, now);
        if changes.session_timeout {
            slot.sync_timeout(session.config().session_timeout_ms);
        }
        Ok((changes, session.config().clone()))
    }

    pub fn force_recalibration(&self, id: &str) -> Result<AnalyzerEvent> {
        let slot = self.require(id)?;
        let now = self.clock.now_ms();
        slot.touch(now);
        let event = slot.lock().force_recalibration(now);
        Ok(event)
    }

    pub fn debug_state(&self, id: &str) -> Result<SessionDebug> {
        let slot = self.require(id)?;
        let last_activity = slot.last_activity();
        let debug = slot.lock().debug_state(last_activity);
        Ok(debug)
    }

    /// Unregister `id`. Returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.write().remove(id).is_some();
        if removed {
            info!(session = %id, "session removed");
        }
        removed
    }

    /// Remove every session idle beyond its timeout. Returns how many went.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|id, slot| {
            let expired = slot.is_expired(now);
            if expired {
                info!(session = %id, "session expired");
            }
            !expired
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let total = self.frames_processed.load(Ordering::Relaxed);
        let speech = self.speech_frames_detected.load(Ordering::Relaxed);
        RegistryStats {
            active_sessions: self.len(),
            total_frames_processed: total,
            speech_frames_detected: speech,
            speech_ratio: speech as f64 / total.max(1) as f64,
            neural_vad_stats: self
                .classifiers
                .neural
                .as_ref()
                .map(|model| model.stats(self.options.defaults.sample_rate)),
        }
    }

    /// Start the periodic expiry sweep on the current tokio runtime.
    ///
    /// The task holds only a weak reference and stops on its own once the
    /// registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let period = self.options.sweep_interval.max(Duration::from_millis(1));
        let registry = Arc::downgrade(self);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(sweep_loop(registry, period, shutdown_rx));
        info!(interval_secs = period.as_secs_f64(), "session sweeper started");
        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn live(&self, id: &str, now: u64) -> Option<SessionHandle> {
        let sessions = self.sessions.read();
        let slot = sessions.get(id)?;
        if slot.is_expired(now) {
            return None;
        }
        slot.touch(now);
        Some(Arc::clone(slot))
    }

    fn require(&self, id: &str) -> Result<SessionHandle> {
        self.get(id)
            .ok_or_else(|| VadError::SessionNotFound(id.to_owned()))
    }

    fn build_session(&self, id: String, now: u64) -> Session {
        Session::new(
            id,
            self.options.defaults.clone(),
            self.options.analyzer.clone(),
            &self.classifiers,
            self.options.history_capacity,
            now,
        )
    }
}

async fn sweep_loop(
    registry: Weak<SessionRegistry>,
    period: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let Some(registry) = registry.upgrade() else { break };
                match std::panic::catch_unwind(AssertUnwindSafe(|| registry.sweep_expired())) {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, remaining = registry.len(), "sweep complete"),
                    Err(_) => error!("session sweep panicked; next sweep still scheduled"),
                }
            }
        }
    }
    info!("session sweeper stopped");
}

/// Owner of the sweep task. Dropping it aborts the task.
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweep and wait for the task to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("session sweeper task failed: {e}");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
