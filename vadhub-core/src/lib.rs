//! # vadhub-core
//!
//! Multi-session voice activity detection engine.
//!
//! ## Architecture
//!
//! ```text
//! ClientMessage → VadService → SessionRegistry ─ Arc<SessionSlot> ─ Mutex<Session>
//!                                                                        │
//!                                              per frame: FrameEnsemble  │
//!                        NoiseFloorAnalyzer + BitstreamClassifier + SpeechProbabilityModel
//!                                                                        │
//!                                          chunk speech ratio → Silent/Speaking → VadEvent
//! ```
//!
//! All session state is in memory. The registry's periodic sweep evicts
//! sessions that have been idle longer than their `sessionTimeoutMs`.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod clock;
pub mod config;
pub mod error;
pub mod ipc;
pub mod service;
pub mod session;
pub mod vad;

// Convenience re-exports for downstream crates
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{VadConfig, VadConfigPatch};
pub use error::{Result, VadError};
pub use ipc::{ClientMessage, VadEvent};
pub use service::VadService;
pub use session::{RegistryOptions, RegistryStats, Session, SessionRegistry, SweeperHandle};
pub use vad::{
    AnalyzerConfig, Classifiers, NeuralConfig, NeuralModelHandle, NoiseFloorAnalyzer,
    RecurrentState, SpeechProbabilityModel,
};

#[cfg(feature = "onnx")]
pub use vad::SileroModel;
