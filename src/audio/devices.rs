//! Input device enumeration
//!
//! Lists capture-capable devices on the default cpal host and resolves the
//! device a recording should use. When a device cannot report its default
//! input config, the fixed 16 kHz fallback is used so every listed device has
//! a concrete format.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, Host};
use serde::Serialize;

use super::recorder::AudioError;

/// Sample rate assumed when a device cannot report its default input config.
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// An input-capable device as reported by the audio host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioDevice {
    /// Position in the host's input device enumeration
    pub index: usize,
    pub name: String,
    /// Channel count of the device's default input config
    pub channels: u16,
    /// Default sample rate in Hz
    pub sample_rate: u32,
    pub is_input: bool,
    /// Whether the host reports this as its default input
    pub is_default: bool,
}

impl AudioDevice {
    /// Human readable label, e.g. `USB Mic (Ch: 1, SR: 48000)`
    pub fn label(&self) -> String {
        format!(
            "{} (Ch: {}, SR: {})",
            self.name, self.channels, self.sample_rate
        )
    }
}

/// Enumerates input devices on the default audio host.
pub struct DeviceRegistry {
    host: Host,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let host = cpal::default_host();
        log::debug!("Audio host: {:?}", host.id());
        Self { host }
    }

    /// List devices with at least one input channel, in host order.
    pub fn list_input_devices(&self) -> Result<Vec<AudioDevice>, AudioError> {
        let default_name = self.default_input_name();
        let devices = self
            .host
            .input_devices()
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

        let described = devices
            .enumerate()
            .map(|(index, device)| describe_device(index, &device, default_name.as_deref()))
            .collect();

        input_only(described)
    }

    /// Resolve the device a recording should use.
    ///
    /// Prefers the platform default input; falls back to the first listed
    /// input device.
    pub fn resolve_default(&self) -> Result<AudioDevice, AudioError> {
        let listed = match self.list_input_devices() {
            Ok(devices) => devices,
            Err(AudioError::NoInputDevice) => Vec::new(),
            Err(e) => return Err(e),
        };

        let platform_default = self
            .host
            .default_input_device()
            .map(|device| describe_device(0, &device, None))
            .map(|mut device| {
                device.is_default = true;
                // Prefer the listed entry so the index matches enumeration order
                listed
                    .iter()
                    .find(|d| d.name == device.name)
                    .cloned()
                    .unwrap_or(device)
            });

        let resolved = pick_default(platform_default, &listed)?;
        log::info!("Resolved input device: {}", resolved.label());
        Ok(resolved)
    }

    /// Find an input device by exact name.
    pub fn find_by_name(&self, name: &str) -> Result<AudioDevice, AudioError> {
        self.list_input_devices()?
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| AudioError::DeviceUnavailable(format!("no input device named {name:?}")))
    }

    /// Look up the live cpal handle for a previously enumerated device.
    pub(crate) fn locate(&self, device: &AudioDevice) -> Result<Device, AudioError> {
        let mut devices = self
            .host
            .input_devices()
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

        devices
            .find(|d| d.name().map(|n| n == device.name).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceUnavailable(device.name.clone()))
    }

    fn default_input_name(&self) -> Option<String> {
        self.host.default_input_device().and_then(|d| d.name().ok())
    }
}

/// Describe a cpal device, applying the sample-rate fallback when the
/// default config query fails.
fn describe_device(index: usize, device: &Device, default_name: Option<&str>) -> AudioDevice {
    let name = device
        .name()
        .unwrap_or_else(|_| format!("Input device {index}"));

    let (channels, sample_rate) = match device.default_input_config() {
        Ok(config) => (config.channels(), config.sample_rate().0),
        Err(e) => {
            log::debug!(
                "Default input config unavailable for {:?} ({}), using {} Hz",
                name,
                e,
                DEFAULT_SAMPLE_RATE
            );
            let channels = device
                .supported_input_configs()
                .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
                .unwrap_or(0);
            (channels, DEFAULT_SAMPLE_RATE)
        }
    };

    AudioDevice {
        index,
        is_default: default_name == Some(name.as_str()),
        name,
        channels,
        sample_rate,
        is_input: channels > 0,
    }
}

/// Keep only input-capable devices; an empty result is `NoInputDevice`.
fn input_only(devices: Vec<AudioDevice>) -> Result<Vec<AudioDevice>, AudioError> {
    let inputs: Vec<AudioDevice> = devices.into_iter().filter(|d| d.channels > 0).collect();
    if inputs.is_empty() {
        return Err(AudioError::NoInputDevice);
    }
    Ok(inputs)
}

/// Default-device policy: the platform default if it can capture, else the
/// first listed input device.
fn pick_default(
    platform_default: Option<AudioDevice>,
    listed: &[AudioDevice],
) -> Result<AudioDevice, AudioError> {
    if let Some(device) = platform_default.filter(|d| d.is_input && d.channels > 0) {
        return Ok(device);
    }
    listed.first().cloned().ok_or(AudioError::NoInputDevice)
}
