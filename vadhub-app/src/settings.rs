//! Persistent host settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vadhub_core::{AnalyzerConfig, NeuralConfig, RegistryOptions, VadConfig};

/// Overrides the settings file location.
pub const SETTINGS_ENV: &str = "VADHUB_SETTINGS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    /// Defaults merged into every new session.
    pub session: VadConfig,
    pub analyzer: AnalyzerConfig,
    pub neural: NeuralConfig,
    pub sweep_interval_secs: u64,
    pub frame_history: usize,
    /// Silero model file; the platform models directory when unset.
    pub silero_model_path: Option<PathBuf>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            session: VadConfig::default(),
            analyzer: AnalyzerConfig::default(),
            neural: NeuralConfig::default(),
            sweep_interval_secs: 60,
            frame_history: 100,
            silero_model_path: None,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.session.normalize();
        self.analyzer.normalize();
        self.neural.threshold = if self.neural.threshold.is_finite() {
            self.neural.threshold.clamp(0.0, 1.0)
        } else {
            0.5
        };
        self.sweep_interval_secs = self.sweep_interval_secs.clamp(1, 3_600);
        self.frame_history = self.frame_history.clamp(1, 10_000);
        if self
            .silero_model_path
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            self.silero_model_path = None;
        }
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            defaults: self.session.clone(),
            analyzer: self.analyzer.clone(),
            history_capacity: self.frame_history,
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

/// `$VADHUB_SETTINGS` if set, otherwise the platform default.
pub fn settings_path() -> PathBuf {
    std::env::var_os(SETTINGS_ENV)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(default_settings_path)
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vadhub")
            .join("settings.json")
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
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut settings: AppSettings = serde_json::from_str(
            r#"{"session":{"aggressiveness":3},"sweepIntervalSecs":0,"unknownKey":1}"#,
        )
        .expect("parse settings");
        settings.normalize();

        assert_eq!(settings.session.aggressiveness, 3);
        assert_eq!(settings.session.sample_rate, 16_000);
        assert_eq!(settings.sweep_interval_secs, 1);
        assert_eq!(settings.frame_history, 100);
        assert_eq!(settings.analyzer.calibration_duration_ms, 2_000);
    }

    #[test]
    fn registry_options_follow_settings() {
        let settings = AppSettings {
            frame_history: 20,
            sweep_interval_secs: 15,
            ..AppSettings::default()
        };
        let options = settings.registry_options();
        assert_eq!(options.history_capacity, 20);
        assert_eq!(options.sweep_interval, Duration::from_secs(15));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = load_settings(Path::new("/nonexistent/vadhub/settings.json"));
        assert_eq!(settings.sweep_interval_secs, 60);
        assert!(settings.silero_model_path.is_none());
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let mut settings = AppSettings {
            neural: NeuralConfig { threshold: 4.0 },
            frame_history: 0,
            silero_model_path: Some(PathBuf::new()),
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.neural.threshold, 1.0);
        assert_eq!(settings.frame_history, 1);
        assert!(settings.silero_model_path.is_none());
    }
}
