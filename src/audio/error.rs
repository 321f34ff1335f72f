//! Audio error types

use thiserror::Error;

/// Errors that can occur in the audio subsystem
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open device: {0}")]
    DeviceOpenFailed(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Playback stalled: device accepted no samples for {0:?}")]
    PlaybackStalled(std::time::Duration),
}
