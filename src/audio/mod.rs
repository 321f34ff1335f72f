//! Audio device collaborators
//!
//! The relay core only needs "read one frame from the microphone" and "write one
//! frame to a speaker". Those seams are traits; `CpalBackend` implements them on
//! real hardware.

mod backend;
mod device;
mod error;

pub use backend::{
    f32_to_pcm16, pcm16_to_f32, AudioBackend, AudioConfig, CpalBackend, FrameSink, FrameSource,
};
pub use device::{
    find_input_device, find_output_device, list_input_devices, list_output_devices, AudioDevice,
    DeviceId,
};
pub use error::AudioError;
