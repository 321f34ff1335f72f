//! Audio device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};

use super::error::AudioError;

/// Unique identifier for an audio device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

/// Information about an audio device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Device identifier
    pub id: DeviceId,
    /// Display name
    pub name: String,
    /// Common sample rates (Hz) the device accepts
    pub supported_sample_rates: Vec<u32>,
    /// Whether this is the default device
    pub is_default: bool,
}

/// List available input (capture) devices
pub fn list_input_devices() -> Vec<AudioDevice> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    host.input_devices()
        .map(|devices| {
            devices
                .filter_map(|device| describe(&device, default_name.as_deref()))
                .collect()
        })
        .unwrap_or_default()
}

/// List available output (playback) devices
pub fn list_output_devices() -> Vec<AudioDevice> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    host.output_devices()
        .map(|devices| {
            devices
                .filter_map(|device| describe(&device, default_name.as_deref()))
                .collect()
        })
        .unwrap_or_default()
}

/// Resolve an input device by name, or the default one
pub fn find_input_device(id: Option<&DeviceId>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match id {
        Some(id) => host
            .input_devices()
            .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?
            .find(|d| d.name().ok().as_ref() == Some(&id.0))
            .ok_or_else(|| AudioError::DeviceNotFound(id.0.clone())),
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".into())),
    }
}

/// Resolve an output device by name, or the default one
pub fn find_output_device(id: Option<&DeviceId>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match id {
        Some(id) => host
            .output_devices()
            .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?
            .find(|d| d.name().ok().as_ref() == Some(&id.0))
            .ok_or_else(|| AudioError::DeviceNotFound(id.0.clone())),
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".into())),
    }
}

fn describe(device: &cpal::Device, default_name: Option<&str>) -> Option<AudioDevice> {
    let name = device.name().ok()?;
    Some(AudioDevice {
        id: DeviceId(name.clone()),
        is_default: default_name == Some(name.as_str()),
        supported_sample_rates: supported_sample_rates(device),
        name,
    })
}

/// Common sample rates that fall inside any of the device's config ranges
fn supported_sample_rates(device: &cpal::Device) -> Vec<u32> {
    let configs: Vec<_> = device
        .supported_input_configs()
        .into_iter()
        .flatten()
        .chain(device.supported_output_configs().into_iter().flatten())
        .collect();

    let mut rates: Vec<u32> = [22050u32, 44100, 48000, 96000]
        .into_iter()
        .filter(|rate| {
            configs
                .iter()
                .any(|c| *rate >= c.min_sample_rate().0 && *rate <= c.max_sample_rate().0)
        })
        .collect();
    rates.sort_unstable();
    rates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_devices_does_not_panic() {
        // Device availability depends on the machine running the tests
        let _inputs = list_input_devices();
        let _outputs = list_output_devices();
    }

    #[test]
    fn test_unknown_device_is_not_found() {
        let id = DeviceId("no such device 1f3a".to_string());
        assert!(find_output_device(Some(&id)).is_err());
    }
}
