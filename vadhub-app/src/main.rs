//! vadhub host entry point.
//!
//! Loads settings, builds the shared classifiers once, starts the session
//! registry and its expiry sweeper, then serves the stdio transport until
//! stdin closes or Ctrl-C arrives.

mod settings;
mod stdio;

use std::sync::Arc;

use settings::{load_settings, settings_path, AppSettings};
use tracing::{info, warn};
use vadhub_core::{Classifiers, Clock, NeuralModelHandle, SessionRegistry, SystemClock, VadService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vadhub=info")),
        )
        .init();

    info!("vadhub starting");

    // ── Settings ──────────────────────────────────────────────────────────
    let path = settings_path();
    let settings = load_settings(&path);
    info!(
        path = %path.display(),
        sample_rate = settings.session.sample_rate,
        sweep_interval_secs = settings.sweep_interval_secs,
        "settings loaded"
    );

    // ── Engine ────────────────────────────────────────────────────────────
    let classifiers = Classifiers::new(load_neural_model(&settings));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(SessionRegistry::new(
        settings.registry_options(),
        classifiers,
        clock,
    ));
    let sweeper = registry.spawn_sweeper();
    let service = Arc::new(VadService::new(
        Arc::clone(&registry),
        settings.analyzer.clone(),
    ));

    let served = tokio::select! {
        result = stdio::serve(Arc::clone(&service)) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            Ok(())
        }
    };

    sweeper.shutdown().await;
    let stats = service.stats();
    info!(
        active_sessions = stats.active_sessions,
        frames = stats.total_frames_processed,
        speech_frames = stats.speech_frames_detected,
        "vadhub stopped"
    );
    served
}

#[cfg(feature = "onnx")]
fn load_neural_model(settings: &AppSettings) -> Option<NeuralModelHandle> {
    let path = settings
        .silero_model_path
        .clone()
        .unwrap_or_else(vadhub_core::SileroModel::default_model_path);
    match vadhub_core::SileroModel::load_shared(&path, settings.neural.clone()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("neural VAD unavailable, continuing without it: {e}");
            None
        }
    }
}

#[cfg(not(feature = "onnx"))]
fn load_neural_model(settings: &AppSettings) -> Option<NeuralModelHandle> {
    if settings.session.use_neural_vad {
        warn!("built without the `onnx` feature; neural VAD votes will be false");
    }
    None
}
