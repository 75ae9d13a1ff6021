use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::media::MediaStream;
use crate::settings::{SettingsRepository, INPUT_DEVICE_KEY, MIC_GAIN_KEY, OUTPUT_DEVICE_KEY};

pub const MIN_GAIN: f32 = 0.0;
pub const MAX_GAIN: f32 = 2.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

/// Microphone gain shared with the capture callback; changes apply live.
#[derive(Debug)]
pub struct GainControl(AtomicU32);

impl GainControl {
    pub fn new(gain: f32) -> Self {
        Self(AtomicU32::new(gain.to_bits()))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, gain: f32) {
        self.0.store(gain.to_bits(), Ordering::Relaxed);
    }
}

impl Default for GainControl {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Platform capture devices. Failures here are permission or hardware
/// problems and are reported as-is, never retried.
pub trait MediaDevices: Send + Sync {
    fn input_devices(&self) -> Result<Vec<AudioDevice>>;
    fn output_devices(&self) -> Result<Vec<AudioDevice>>;
    fn open_microphone(&self, device_id: Option<&str>, gain: Arc<GainControl>) -> Result<MediaStream>;
    fn open_screen(&self) -> Result<MediaStream>;
}

pub struct LocalMediaController {
    devices: Arc<dyn MediaDevices>,
    settings: Arc<dyn SettingsRepository>,
    gain: Arc<GainControl>,
    input_device: Option<String>,
    output_device: Option<String>,
}

impl LocalMediaController {
    /// Restores device choices and gain from `settings`.
    pub fn new(devices: Arc<dyn MediaDevices>, settings: Arc<dyn SettingsRepository>) -> Self {
        let input_device = load_or_warn(settings.as_ref(), INPUT_DEVICE_KEY);
        let output_device = load_or_warn(settings.as_ref(), OUTPUT_DEVICE_KEY);
        let gain = load_or_warn(settings.as_ref(), MIC_GAIN_KEY)
            .and_then(|raw| match raw.parse::<f32>() {
                Ok(g) if g.is_finite() => Some(g.clamp(MIN_GAIN, MAX_GAIN)),
                _ => {
                    warn!("Ignoring invalid stored mic gain {:?}", raw);
                    None
                }
            })
            .unwrap_or(1.0);

        Self {
            devices,
            settings,
            gain: Arc::new(GainControl::new(gain)),
            input_device,
            output_device,
        }
    }

    pub fn list_input_devices(&self) -> Result<Vec<AudioDevice>> {
        self.devices.input_devices()
    }

    pub fn list_output_devices(&self) -> Result<Vec<AudioDevice>> {
        self.devices.output_devices()
    }

    pub fn selected_input_device(&self) -> Option<&str> {
        self.input_device.as_deref()
    }

    pub fn selected_output_device(&self) -> Option<&str> {
        self.output_device.as_deref()
    }

    /// `None` returns to the system default.
    pub fn select_input_device(&mut self, device_id: Option<&str>) -> Result<()> {
        if let Some(id) = device_id {
            if !self.devices.input_devices()?.iter().any(|d| d.id == id) {
                return Err(Error::Device(format!("Unknown input device: {}", id)));
            }
        }
        persist(self.settings.as_ref(), INPUT_DEVICE_KEY, device_id)?;
        self.input_device = device_id.map(str::to_string);
        info!("Input device set to {}", device_id.unwrap_or("default"));
        Ok(())
    }

    pub fn select_output_device(&mut self, device_id: Option<&str>) -> Result<()> {
        if let Some(id) = device_id {
            if !self.devices.output_devices()?.iter().any(|d| d.id == id) {
                return Err(Error::Device(format!("Unknown output device: {}", id)));
            }
        }
        persist(self.settings.as_ref(), OUTPUT_DEVICE_KEY, device_id)?;
        self.output_device = device_id.map(str::to_string);
        info!("Output device set to {}", device_id.unwrap_or("default"));
        Ok(())
    }

    pub fn mic_gain(&self) -> f32 {
        self.gain.get()
    }

    /// Clamps to `MIN_GAIN..=MAX_GAIN` and returns the applied value.
    pub fn set_mic_gain(&mut self, gain: f32) -> Result<f32> {
        if !gain.is_finite() {
            return Err(Error::Device(format!("Invalid gain: {}", gain)));
        }
        let gain = gain.clamp(MIN_GAIN, MAX_GAIN);
        self.gain.set(gain);
        self.settings.save(MIC_GAIN_KEY, &gain.to_string())?;
        Ok(gain)
    }

    /// Opens the selected microphone, falling back to the default device
    /// when the stored choice has disappeared.
    pub fn open_local_stream(&self) -> Result<MediaStream> {
        let mut device = self.input_device.as_deref();
        if let Some(id) = device {
            let present = self.devices.input_devices()?.iter().any(|d| d.id == id);
            if !present {
                warn!("Input device {} is gone, using the default", id);
                device = None;
            }
        }
        self.devices.open_microphone(device, self.gain.clone())
    }

    pub fn open_screen_stream(&self) -> Result<MediaStream> {
        self.devices.open_screen()
    }
}

fn load_or_warn(settings: &dyn SettingsRepository, key: &str) -> Option<String> {
    match settings.load(key) {
        Ok(value) => value,
        Err(e) => {
            warn!("Could not load setting {}: {}", key, e);
            None
        }
    }
}

fn persist(settings: &dyn SettingsRepository, key: &str, value: Option<&str>) -> Result<()> {
    match value {
        Some(value) => settings.save(key, value),
        None => settings.remove(key),
    }
}
