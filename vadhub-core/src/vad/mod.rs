//! Voice Activity Detection building blocks.
//!
//! Three independent judgments are fused per frame by `FrameEnsemble`:
//!
//! - `NoiseFloorAnalyzer`: adaptive energy threshold over normalised RMS.
//! - `BitstreamClassifier`: deterministic fixed-window classifier over raw
//!   PCM16 (`WebRtcVad` by default, swappable via `BitstreamFactory`).
//! - `SpeechProbabilityModel`: neural speech probability behind a shared
//!   `NeuralModelHandle` (`SileroModel` with the `onnx` feature).

pub mod bitstream;
pub mod ensemble;
pub mod neural;
pub mod noise_floor;

#[cfg(feature = "onnx")]
pub mod silero;

#[cfg(feature = "onnx")]
pub use silero::SileroModel;

pub use bitstream::{BitstreamClassifier, BitstreamFactory, WebRtcVad};
pub use ensemble::{AudioFrame, Classifiers, FrameEnsemble, FrameVotes};
pub use neural::{
    NeuralConfig, NeuralModelHandle, NeuralVote, RecurrentState, SpeechProbabilityModel,
};
pub use noise_floor::{AnalyzerConfig, AnalyzerEvent, NoiseFloorAnalyzer, NoiseProfile};

/// Whether a given audio frame contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// The frame contains speech.
    Speech,
    /// The frame is silent (or below threshold).
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

impl From<bool> for VadDecision {
    fn from(is_speech: bool) -> Self {
        if is_speech {
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }
}
