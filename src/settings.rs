use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const APP_DIR_NAME: &str = "clip-recorder";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Settings I/O failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSettings {
    /// A STOP before this many time units have elapsed discards the attempt.
    pub min_length: u32,

    /// The accumulator admits at most this many chunks; the next one ends the
    /// recording with a truncated artifact.
    pub max_length: u32,

    /// Length of one device data slice. Each slice is one time unit.
    pub time_slice_ms: u64,

    /// Formats tried in order when negotiating with the capture backend.
    pub candidate_formats: Vec<String>,

    /// Result of the last successful negotiation.
    pub supported_format: Option<String>,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            min_length: 2,
            max_length: 60,
            time_slice_ms: 1000,
            candidate_formats: vec![
                "audio/webm;codecs=opus".to_string(),
                "audio/ogg;codecs=opus".to_string(),
                "audio/L16;rate=48000;channels=1".to_string(),
                "audio/L16;rate=44100;channels=1".to_string(),
            ],
            supported_format: None,
        }
    }
}

impl RecorderSettings {
    pub fn session_config(&self) -> Result<SessionConfig, SettingsError> {
        let config = SessionConfig {
            min_length: self.min_length,
            max_length: self.max_length,
            time_slice: Duration::from_millis(self.time_slice_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Limits a recording session runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub min_length: u32,
    pub max_length: u32,
    pub time_slice: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_length: 2,
            max_length: 60,
            time_slice: Duration::from_millis(1000),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_length == 0 {
            return Err(SettingsError::Invalid(
                "max_length must be at least 1".to_string(),
            ));
        }
        if self.min_length > self.max_length {
            return Err(SettingsError::Invalid(format!(
                "min_length {} exceeds max_length {}",
                self.min_length, self.max_length
            )));
        }
        if self.time_slice.is_zero() {
            return Err(SettingsError::Invalid(
                "time_slice_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> RecorderSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            RecorderSettings::default()
        }
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings_from(path: &Path) -> RecorderSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<RecorderSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                RecorderSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => RecorderSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            RecorderSettings::default()
        }
    }
}

pub fn save_settings(settings: &RecorderSettings) -> Result<(), SettingsError> {
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &RecorderSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write to a sibling temp file, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(|source| SettingsError::Io {
        path: tmp_path.clone(),
        source,
    })?;

    // rename does not replace an existing file on Windows
    if cfg!(windows) && path.exists() {
        if let Err(source) = std::fs::remove_file(path) {
            if source.kind() != std::io::ErrorKind::NotFound {
                return Err(SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    log::debug!("Settings: saved to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("nope.json"));
        assert_eq!(settings, RecorderSettings::default());
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings_from(&path), RecorderSettings::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{ "min_length": 5 }"#).unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.min_length, 5);
        assert_eq!(settings.max_length, 60);
        assert_eq!(settings.candidate_formats.len(), 4);
    }

    #[test]
    fn save_then_load_keeps_cached_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let settings = RecorderSettings {
            supported_format: Some("audio/ogg;codecs=opus".to_string()),
            ..Default::default()
        };

        save_settings_to(&path, &settings).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_settings_from(&path), settings);

        // overwriting an existing file works too
        let settings = RecorderSettings {
            max_length: 10,
            ..settings
        };
        save_settings_to(&path, &settings).unwrap();
        assert_eq!(load_settings_from(&path).max_length, 10);
    }

    #[test]
    fn session_config_is_validated() {
        let config = RecorderSettings::default().session_config().unwrap();
        assert_eq!(config.time_slice, Duration::from_millis(1000));
        assert_eq!(config, SessionConfig::default());

        let bad = RecorderSettings {
            max_length: 0,
            min_length: 0,
            ..Default::default()
        };
        assert!(matches!(bad.session_config(), Err(SettingsError::Invalid(_))));

        let bad = RecorderSettings {
            min_length: 10,
            max_length: 5,
            ..Default::default()
        };
        assert!(bad.session_config().is_err());

        let bad = RecorderSettings {
            time_slice_ms: 0,
            ..Default::default()
        };
        assert!(bad.session_config().is_err());
    }
}
