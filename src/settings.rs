//! Key-value settings persistence for device choices and gain.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

pub const INPUT_DEVICE_KEY: &str = "audio.input_device";
pub const OUTPUT_DEVICE_KEY: &str = "audio.output_device";
pub const MIC_GAIN_KEY: &str = "audio.mic_gain";

pub trait SettingsRepository: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn save(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| Error::Config("settings lock poisoned".to_string()))
    }
}

impl SettingsRepository for MemorySettings {
    fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values()?.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        self.values()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values()?.remove(key);
        Ok(())
    }
}

/// Flat TOML table on disk, rewritten on every save.
#[derive(Debug)]
pub struct TomlSettings {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl TomlSettings {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse {:?}: {}", path, e)))?
        } else {
            info!("Settings file not found, starting empty at {:?}", path);
            BTreeMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// `settings.toml` next to the config file.
    pub fn default_path() -> Result<PathBuf> {
        Ok(crate::config::config_dir()?.join("settings.toml"))
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(values)
            .map_err(|e| Error::Config(format!("Failed to serialize settings: {}", e)))?;
        std::fs::write(&self.path, content)?;
        debug!("Saved settings to {:?}", self.path);
        Ok(())
    }

    fn values(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| Error::Config("settings lock poisoned".to_string()))
    }
}

impl SettingsRepository for TomlSettings {
    fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values()?.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values()?;
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values()?;
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_settings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        let settings = TomlSettings::open(&path).unwrap();
        settings.save(INPUT_DEVICE_KEY, "USB Mic").unwrap();
        settings.save(MIC_GAIN_KEY, "1.5").unwrap();
        settings.remove(MIC_GAIN_KEY).unwrap();

        let reopened = TomlSettings::open(&path).unwrap();
        assert_eq!(reopened.load(INPUT_DEVICE_KEY).unwrap().as_deref(), Some("USB Mic"));
        assert_eq!(reopened.load(MIC_GAIN_KEY).unwrap(), None);
    }

    #[test]
    fn memory_settings_round_trip() {
        let settings = MemorySettings::new();
        assert_eq!(settings.load(OUTPUT_DEVICE_KEY).unwrap(), None);
        settings.save(OUTPUT_DEVICE_KEY, "Speakers").unwrap();
        assert_eq!(settings.load(OUTPUT_DEVICE_KEY).unwrap().as_deref(), Some("Speakers"));
    }
}
