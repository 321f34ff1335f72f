//! Blocking frame I/O over cpal streams
//!
//! cpal delivers samples on its own real-time callback thread. Each source and
//! sink bridges that callback to blocking frame reads/writes through an SPSC
//! ring buffer, so the device itself paces the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, error, info, warn};

use crate::protocol::ClientId;

use super::device::{find_input_device, find_output_device, DeviceId};
use super::error::AudioError;

const BYTES_PER_SAMPLE: usize = 2;
const DEVICE_POLL: Duration = Duration::from_millis(2);

/// PCM format shared by capture, the wire and playback
///
/// Samples are signed 16-bit little-endian.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Frame size in samples per channel
    pub frame_size: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 1,
            frame_size: 4096,
        }
    }
}

impl AudioConfig {
    /// Bytes in one frame on the wire
    pub fn frame_bytes(&self) -> usize {
        self.frame_size as usize * self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Playback time of one frame
    pub fn frame_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_size as f64 / self.sample_rate as f64)
    }
}

/// Microphone side: produces fixed-size frames
pub trait FrameSource {
    /// Block until up to `len` bytes of PCM are available
    ///
    /// May return fewer bytes when the device falls behind; never fails on overflow.
    fn read_frame(&mut self, len: usize) -> Result<Vec<u8>, AudioError>;
}

/// Speaker side: consumes frames at the device's rate
pub trait FrameSink {
    /// Block until the device has accepted the whole frame
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), AudioError>;
}

/// Opens sources and sinks
///
/// Devices are opened on the thread that uses them, so sources and sinks need
/// not be `Send`.
pub trait AudioBackend: Send + Sync {
    fn open_source(&self) -> Result<Box<dyn FrameSource>, AudioError>;

    /// Open one playback output for a remote sender
    fn open_sink(&self, sender: ClientId) -> Result<Box<dyn FrameSink>, AudioError>;
}

/// Audio backend on the system's default cpal host
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    config: AudioConfig,
    input_device: Option<DeviceId>,
    output_device: Option<DeviceId>,
}

impl CpalBackend {
    pub fn new(
        config: AudioConfig,
        input_device: Option<DeviceId>,
        output_device: Option<DeviceId>,
    ) -> Self {
        Self {
            config,
            input_device,
            output_device,
        }
    }

    fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            channels: self.config.channels,
            sample_rate: cpal::SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    }

    /// Ring capacity in samples: `frames` whole frames
    fn ring_capacity(&self, frames: usize) -> usize {
        (self.config.frame_size as usize * self.config.channels as usize * frames).max(1)
    }
}

impl AudioBackend for CpalBackend {
    fn open_source(&self) -> Result<Box<dyn FrameSource>, AudioError> {
        let device = find_input_device(self.input_device.as_ref())?;
        info!(
            "Starting capture on device: {}",
            device.name().unwrap_or_default()
        );

        let (mut producer, consumer) = HeapRb::<f32>::new(self.ring_capacity(4)).split();
        let overflowed = Arc::new(AtomicU64::new(0));
        let overflowed_cb = overflowed.clone();

        let stream = device
            .build_input_stream(
                &self.stream_config(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let pushed = producer.push_slice(data);
                    if pushed < data.len() {
                        overflowed_cb.fetch_add((data.len() - pushed) as u64, Ordering::Relaxed);
                    }
                },
                |err| error!("Capture stream error: {:?}", err),
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        debug!("Capture started with config: {:?}", self.config);

        Ok(Box::new(CpalSource {
            _stream: stream,
            consumer,
            overflowed,
            max_wait: self.config.frame_duration() * 4,
        }))
    }

    fn open_sink(&self, sender: ClientId) -> Result<Box<dyn FrameSink>, AudioError> {
        let device = find_output_device(self.output_device.as_ref())?;
        info!(
            "Starting playback for client {} on device: {}",
            sender,
            device.name().unwrap_or_default()
        );

        // Two frames of headroom: one playing, one queued
        let (producer, mut consumer) = HeapRb::<f32>::new(self.ring_capacity(2)).split();

        let stream = device
            .build_output_stream(
                &self.stream_config(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        *sample = consumer.try_pop().unwrap_or(0.0);
                    }
                },
                move |err| error!("Playback stream error for client {}: {:?}", sender, err),
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Box::new(CpalSink {
            _stream: stream,
            producer,
            max_wait: (self.config.frame_duration() * 4).max(Duration::from_secs(1)),
        }))
    }
}

struct CpalSource {
    _stream: Stream,
    consumer: HeapCons<f32>,
    overflowed: Arc<AtomicU64>,
    max_wait: Duration,
}

impl FrameSource for CpalSource {
    fn read_frame(&mut self, len: usize) -> Result<Vec<u8>, AudioError> {
        let wanted = len / BYTES_PER_SAMPLE;
        let mut samples = vec![0.0f32; wanted];
        let mut filled = 0;
        let deadline = Instant::now() + self.max_wait;

        while filled < wanted {
            filled += self.consumer.pop_slice(&mut samples[filled..]);
            if filled < wanted {
                if Instant::now() >= deadline {
                    debug!("Capture short read: {} of {} samples", filled, wanted);
                    break;
                }
                thread::sleep(DEVICE_POLL);
            }
        }

        let dropped = self.overflowed.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            warn!("Capture overflow: {} samples dropped", dropped);
        }

        samples.truncate(filled);
        Ok(f32_to_pcm16(&samples))
    }
}

struct CpalSink {
    _stream: Stream,
    producer: HeapProd<f32>,
    max_wait: Duration,
}

impl FrameSink for CpalSink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), AudioError> {
        let samples = pcm16_to_f32(frame);
        let mut written = 0;
        let mut last_progress = Instant::now();

        while written < samples.len() {
            let pushed = self.producer.push_slice(&samples[written..]);
            written += pushed;
            if written < samples.len() {
                if pushed > 0 {
                    last_progress = Instant::now();
                } else if last_progress.elapsed() >= self.max_wait {
                    return Err(AudioError::PlaybackStalled(self.max_wait));
                }
                thread::sleep(DEVICE_POLL);
            }
        }

        // Return once the device has drained down to about one frame of backlog
        let deadline = Instant::now() + self.max_wait;
        while self.producer.occupied_len() > samples.len() {
            if Instant::now() >= deadline {
                return Err(AudioError::PlaybackStalled(self.max_wait));
            }
            thread::sleep(DEVICE_POLL);
        }
        Ok(())
    }
}

/// Decode little-endian 16-bit PCM to normalised floats
///
/// A trailing odd byte is ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}

/// Encode normalised floats as little-endian 16-bit PCM, clipping out-of-range samples
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|s| ((s.clamp(-1.0, 1.0) * 32767.0) as i16).to_le_bytes())
        .collect()
}
