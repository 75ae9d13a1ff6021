use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::chat::BackoffPolicy;
use crate::error::{Error, Result};
use crate::levels::LevelThresholds;
use crate::signaling::IceServer;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signaling: SignalingConfig,
    pub chat: ChatConfig,
    pub audio: AudioConfig,
    pub ice: IceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub url: String,
    pub display_name: Option<String>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            display_name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub base_url: String,
    /// Bearer token for the assistant backend. Token storage lives elsewhere.
    pub token: Option<String>,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            base_url: "http://127.0.0.1:8000/api".to_string(),
            token: None,
            initial_delay_ms: backoff.initial_delay.as_millis() as u64,
            multiplier: backoff.multiplier,
            max_delay_ms: backoff.max_delay.as_millis() as u64,
            max_retries: backoff.max_retries,
        }
    }
}

impl ChatConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_retries: self.max_retries,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub analysis_interval_ms: u64,
    pub thresholds: LevelThresholds,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            analysis_interval_ms: 100,
            thresholds: LevelThresholds::default(),
        }
    }
}

impl AudioConfig {
    pub fn analysis_interval(&self) -> Duration {
        Duration::from_millis(self.analysis_interval_ms.max(10))
    }
}

/// Fallback ICE servers, used until the server's `joined` supplies its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                username: None,
                credential: None,
            }],
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&config_dir()?.join("config.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Config file not found, creating default at {:?}", path);
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join("meetroom"))
        .ok_or_else(|| Error::Config("No config directory on this platform".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.chat.max_retries, 5);
        assert_eq!(config.audio.thresholds, LevelThresholds::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[chat]\nbase_url = \"https://assistant.example.org/api\"\nmax_retries = 2\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.chat.base_url, "https://assistant.example.org/api");
        let backoff = config.chat.backoff();
        assert_eq!(backoff.max_retries, 2);
        assert_eq!(backoff.initial_delay, Duration::from_millis(1000));
        assert_eq!(config.signaling.url, "ws://127.0.0.1:8080/ws");
    }
}
