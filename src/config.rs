//! Persistent application configuration
//!
//! Stores device selection and the measurement parameters in a JSON file
//! at `%APPDATA%/earbudtester/config.json` (Windows) or equivalent.

use anyhow::Context;
use earbudtester_core::config::MeasurementConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persistent application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Microphone device name (None = system default)
    #[serde(default)]
    pub input_device: Option<String>,
    /// Earbud output device name (None = system default)
    #[serde(default)]
    pub output_device: Option<String>,
    /// Measurement parameters
    #[serde(default)]
    pub measurement: MeasurementConfig,
}

impl AppConfig {
    /// Config file path: `<data_dir>/earbudtester/config.json`
    pub fn path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("earbudtester")
            .join("config.json")
    }

    /// Load config from the default path, falling back to defaults on any error
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Load config from `path`, falling back to defaults on any error
    ///
    /// A file whose measurement section is out of range is also replaced by
    /// defaults.
    pub fn load_from(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                return Self::default();
            }
        };

        match serde_json::from_str::<Self>(&contents) {
            Ok(config) => match config.measurement.validate() {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "Loaded config from disk");
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Invalid measurement config, using defaults"
                    );
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to parse config, using defaults"
                );
                Self::default()
            }
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }
}
