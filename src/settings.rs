use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::audio::DEFAULT_FRAME_SAMPLES;
use crate::history::DEFAULT_HISTORY_LIMIT;

const SETTINGS_DIR_NAME: &str = "voice-assistant";
const SETTINGS_FILE_NAME: &str = "settings.json";

pub const DEFAULT_CHAT_MODEL: &str = "gpt-4-turbo-preview";
pub const DEFAULT_TTS_MODEL: &str = "gpt-4o-mini-tts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantSettings {
    /// Language code used for transcription, replies and synthesis.
    pub language: String,

    /// Synthesis voice.
    pub voice: String,

    /// Number of completed turns kept as generation context.
    pub history_limit: usize,

    /// Capture frame length in samples per channel.
    pub frame_samples: usize,

    /// Directory reply artifacts are written to.
    pub output_dir: PathBuf,

    /// Input device name. `None` uses the platform default.
    pub input_device: Option<String>,

    /// Recordings are stopped automatically after this many seconds.
    pub max_recording_secs: u64,
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            voice: "alloy".to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            output_dir: PathBuf::from("temp_audio"),
            input_device: None,
            max_recording_secs: 120,
        }
    }
}

/// Endpoint and credential configuration for the HTTP collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub api_key: String,
    pub whisper_url: String,
    pub chat_url: String,
    pub chat_model: String,
    pub tts_url: String,
    pub tts_model: String,
}

impl ProviderConfig {
    /// Read provider configuration from the environment.
    /// Returns `None` if any required variable is missing or empty.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let required = ["AZURE_API_KEY", "WHISPER_API_URL", "CHAT_API_URL", "TTS_API_URL"];
        let missing: Vec<&str> = required.into_iter().filter(|k| get(k).is_none()).collect();
        if !missing.is_empty() {
            log::warn!("Provider configuration incomplete, missing: {}", missing.join(", "));
            return None;
        }

        Some(Self {
            api_key: get("AZURE_API_KEY")?,
            whisper_url: get("WHISPER_API_URL")?,
            chat_url: get("CHAT_API_URL")?,
            chat_model: get("CHAT_MODEL").unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            tts_url: get("TTS_API_URL")?,
            tts_model: get("TTS_MODEL").unwrap_or_else(|| DEFAULT_TTS_MODEL.to_string()),
        })
    }
}

/// ~/.config/voice-assistant/settings.json (platform equivalent elsewhere)
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(SETTINGS_DIR_NAME)
        .join(SETTINGS_FILE_NAME)
}

pub fn load_settings(path: &Path) -> AssistantSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AssistantSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AssistantSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AssistantSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AssistantSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AssistantSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a sibling temp file, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("settings.json"));
        assert_eq!(settings, AssistantSettings::default());
        assert_eq!(settings.history_limit, 10);
        assert_eq!(settings.max_recording_secs, 120);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = AssistantSettings {
            language: "es".to_string(),
            voice: "nova".to_string(),
            input_device: Some("USB Mic".to_string()),
            ..Default::default()
        };
        save_settings(&path, &settings).unwrap();

        assert_eq!(load_settings(&path), settings);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"voice": "echo"}"#).unwrap();

        let settings = load_settings(&path);
        assert_eq!(settings.voice, "echo");
        assert_eq!(settings.language, "en");
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings(&path), AssistantSettings::default());
    }

    #[test]
    fn test_provider_config_lookup() {
        let mut env: HashMap<&str, &str> = HashMap::from([
            ("AZURE_API_KEY", "key"),
            ("WHISPER_API_URL", "https://stt"),
            ("CHAT_API_URL", "https://chat"),
            ("TTS_API_URL", "https://tts"),
        ]);

        let config = ProviderConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.chat_model, DEFAULT_CHAT_MODEL);
        assert_eq!(config.tts_model, DEFAULT_TTS_MODEL);

        env.insert("TTS_API_URL", "  ");
        assert!(ProviderConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).is_none());
    }
}
