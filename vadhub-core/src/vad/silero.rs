//! Silero VAD ONNX backend for the neural speech-probability contract.
//!
//! Handles both the v3/v4 LSTM interface (separate `h`/`c` tensors) and the
//! v5 GRU interface (single `state` tensor); tensor names are resolved from
//! the model's declared inputs and outputs at load time.
//!
//! | Model | State in     | State out       | State shape  |
//! |-------|--------------|-----------------|--------------|
//! | v4    | `h`, `c`     | `hn`, `cn`      | `[2, 1, 64]` |
//! | v5    | `state`      | `stateN`        | `[2, 1, 128]`|
//!
//! One `SileroModel` is shared by every session. Recurrent tensors are read
//! from and written back to the caller's `RecurrentState`, which starts zeroed.

use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::{Array1, Array2, Array3};
use ort::session::builder::SessionBuilder;
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use tracing::{info, warn};

use super::neural::{NeuralConfig, NeuralModelHandle, RecurrentState, SpeechProbabilityModel};
use crate::error::{Result, VadError};

const LSTM_UNITS: usize = 64;
const GRU_UNITS: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Recurrence {
    Lstm {
        h_in: String,
        c_in: String,
        h_out: String,
        c_out: String,
    },
    Gru {
        state_in: String,
        state_out: Option<String>,
    },
    Stateless,
}

impl Recurrence {
    fn units(&self) -> usize {
        match self {
            Recurrence::Gru { .. } => GRU_UNITS,
            _ => LSTM_UNITS,
        }
    }
}

/// Silero VAD model loaded through ONNX Runtime.
pub struct SileroModel {
    session: Session,
    input_name: String,
    sr_name: Option<String>,
    output_name: String,
    recurrence: Recurrence,
}

impl SileroModel {
    /// Load the model from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VadError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }

        let session = SessionBuilder::new()
            .map_err(onnx)?
            .commit_from_file(path)
            .map_err(onnx)?;

        let inputs: Vec<String> = session
            .inputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        let outputs: Vec<String> = session
            .outputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();

        let input_name = resolve_name(&inputs, &["input", "audio", "x"])
            .or_else(|| inputs.first().cloned())
            .ok_or_else(|| VadError::OnnxSession("Silero model has no inputs".into()))?;
        let output_name = resolve_name(&outputs, &["output", "speech_prob", "prob"])
            .or_else(|| outputs.first().cloned())
            .ok_or_else(|| VadError::OnnxSession("Silero model has no outputs".into()))?;
        let sr_name = resolve_name(&inputs, &["sr", "sample_rate"]);

        let lstm = (
            resolve_name(&inputs, &["h", "state_h"]),
            resolve_name(&inputs, &["c", "state_c"]),
            resolve_name(&outputs, &["hn", "state_hn", "h_out"]),
            resolve_name(&outputs, &["cn", "state_cn", "c_out"]),
        );
        let recurrence = match lstm {
            (Some(h_in), Some(c_in), Some(h_out), Some(c_out)) => Recurrence::Lstm {
                h_in,
                c_in,
                h_out,
                c_out,
            },
            _ => match resolve_name(&inputs, &["state", "h_0", "hidden"]) {
                Some(state_in) => Recurrence::Gru {
                    state_in,
                    state_out: resolve_name(&outputs, &["stateN", "state_out", "hn_out"]),
                },
                None => Recurrence::Stateless,
            },
        };

        info!(
            path = %path.display(),
            ?inputs,
            ?outputs,
            ?recurrence,
            "Silero VAD model loaded"
        );

        Ok(Self {
            session,
            input_name,
            sr_name,
            output_name,
            recurrence,
        })
    }

    /// Load the model and wrap it in a shared handle, recording load time.
    pub fn load_shared(path: impl AsRef<Path>, config: NeuralConfig) -> Result<NeuralModelHandle> {
        let started = Instant::now();
        let model = Self::load(path)?;
        let load_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!("Silero VAD ready in {load_time_ms:.1} ms");
        Ok(NeuralModelHandle::with_load_time(model, config, load_time_ms))
    }

    /// Conventional model location under the platform data directory.
    pub fn default_model_path() -> PathBuf {
        #[cfg(target_os = "windows")]
        {
            std::env::var_os("APPDATA")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("vadhub")
                .join("models")
                .join("silero_vad.onnx")
        }
        #[cfg(not(target_os = "windows"))]
        {
            std::env::var_os("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    std::env::var_os("HOME")
                        .map(PathBuf::from)
                        .unwrap_or_else(|| PathBuf::from("/tmp"))
                        .join(".local")
                        .join("share")
                })
                .join("vadhub")
                .join("models")
                .join("silero_vad.onnx")
        }
    }

    fn state_value(&self, data: &[f32]) -> Result<Value> {
        let arr = Array3::<f32>::from_shape_vec((2, 1, self.recurrence.units()), data.to_vec())
            .map_err(onnx)?;
        Ok(Value::from_array(arr).map_err(onnx)?.into_dyn())
    }

    /// Zero any tensor whose size does not match the current interface.
    fn prepare_state(&self, state: &mut RecurrentState) {
        let len = 2 * self.recurrence.units();
        if state.hidden.len() != len {
            state.hidden = vec![0.0; len];
        }
        let cell_len = match self.recurrence {
            Recurrence::Lstm { .. } => len,
            _ => 0,
        };
        if state.cell.len() != cell_len {
            state.cell = vec![0.0; cell_len];
        }
    }
}

impl SpeechProbabilityModel for SileroModel {
    fn predict(
        &mut self,
        window: &[f32],
        sample_rate: u32,
        state: &mut RecurrentState,
    ) -> Result<f32> {
        self.prepare_state(state);
        let input = Array2::<f32>::from_shape_vec((1, window.len()), window.to_vec())
            .map_err(|e| VadError::Inference(e.to_string()))?;

        let mut feeds: Vec<(String, SessionInputValue<'_>)> = vec![(
            self.input_name.clone(),
            Value::from_array(input).map_err(onnx)?.into(),
        )];
        if let Some(sr_name) = &self.sr_name {
            let sr = Array1::<i64>::from_elem(1, i64::from(sample_rate));
            feeds.push((sr_name.clone(), Value::from_array(sr).map_err(onnx)?.into()));
        }
        match &self.recurrence {
            Recurrence::Lstm { h_in, c_in, .. } => {
                feeds.push((h_in.clone(), self.state_value(&state.hidden)?.into()));
                feeds.push((c_in.clone(), self.state_value(&state.cell)?.into()));
            }
            Recurrence::Gru { state_in, .. } => {
                feeds.push((state_in.clone(), self.state_value(&state.hidden)?.into()));
            }
            Recurrence::Stateless => {}
        }

        let outputs = self.session.run(feeds).map_err(onnx)?;

        let prob = match outputs.get(self.output_name.as_str()) {
            Some(value) => {
                let (_, data) = value.try_extract_tensor::<f32>().map_err(onnx)?;
                data.first().copied().unwrap_or(0.0)
            }
            None => {
                return Err(VadError::Inference(format!(
                    "missing output tensor {}",
                    self.output_name
                )))
            }
        };

        let mut next_state = None;
        let mut next_cell = None;
        let mut lost_state = false;
        match &self.recurrence {
            Recurrence::Lstm { h_out, c_out, .. } => {
                match (outputs.get(h_out.as_str()), outputs.get(c_out.as_str())) {
                    (Some(h), Some(c)) => {
                        next_state = Some(h.try_extract_tensor::<f32>().map_err(onnx)?.1.to_vec());
                        next_cell = Some(c.try_extract_tensor::<f32>().map_err(onnx)?.1.to_vec());
                    }
                    _ => lost_state = true,
                }
            }
            Recurrence::Gru {
                state_out: Some(state_out),
                ..
            } => match outputs.get(state_out.as_str()) {
                Some(s) => {
                    next_state = Some(s.try_extract_tensor::<f32>().map_err(onnx)?.1.to_vec());
                }
                None => lost_state = true,
            },
            _ => {}
        }
        drop(outputs);

        if let Some(hidden) = next_state {
            state.hidden = hidden;
        }
        if let Some(cell) = next_cell {
            state.cell = cell;
        }
        if lost_state {
            warn!("Silero state outputs missing; running stateless");
            self.recurrence = Recurrence::Stateless;
            state.clear();
        }

        Ok(prob.clamp(0.0, 1.0))
    }
}

fn onnx(e: impl std::fmt::Display) -> VadError {
    VadError::OnnxSession(e.to_string())
}

fn resolve_name(candidates: &[String], preferred: &[&str]) -> Option<String> {
    preferred.iter().find_map(|needle| {
        candidates
            .iter()
            .find(|name| name.eq_ignore_ascii_case(needle))
            .cloned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_is_reported() {
        let err = SileroModel::load("/nonexistent/silero_vad.onnx")
            .err()
            .expect("load should fail");
        assert!(matches!(err, VadError::ModelNotFound { .. }));
    }

    #[test]
    fn tensor_names_resolve_case_insensitively() {
        let names = vec!["Input".to_string(), "stateN".to_string()];
        assert_eq!(resolve_name(&names, &["input"]).as_deref(), Some("Input"));
        assert_eq!(
            resolve_name(&names, &["state_out", "statEn"]).as_deref(),
            Some("stateN")
        );
        assert!(resolve_name(&names, &["sr"]).is_none());
    }
}
