//! Per-sender playback engines
//!
//! Each remote sender gets its own jitter buffer and a dedicated thread that owns
//! the speaker output. The thread paces itself on the device's blocking writes
//! and polls with short sleeps while filling or underrunning, so a stop request
//! is seen within one poll interval (plus at most one device write).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::audio::AudioBackend;
use crate::protocol::ClientId;

use super::error::ClientError;
use super::jitter_buffer::{
    JitterBuffer, JitterBufferConfig, JitterBufferResult, JitterBufferStats, PushOutcome,
};

/// Settings shared by every playback engine of a client
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Bytes in one frame; also the length of synthesized silence
    pub frame_bytes: usize,
    /// Sleep between checks while filling or after an underrun
    pub poll_interval: Duration,
    pub jitter: JitterBufferConfig,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            frame_bytes: 8192,
            poll_interval: Duration::from_millis(10),
            jitter: JitterBufferConfig::default(),
        }
    }
}

/// One sender's jitter buffer plus the thread draining it
pub struct PlaybackEngine {
    sender: ClientId,
    buffer: Arc<Mutex<JitterBuffer>>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackEngine {
    /// Start a playback thread for `sender`
    ///
    /// The output device is opened on the new thread and released when it exits.
    pub fn spawn(
        sender: ClientId,
        backend: Arc<dyn AudioBackend>,
        config: &PlaybackConfig,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, ClientError> {
        let buffer = Arc::new(Mutex::new(JitterBuffer::with_config(config.jitter.clone())));
        let thread_buffer = buffer.clone();
        let frame_bytes = config.frame_bytes;
        let poll_interval = config.poll_interval;

        let thread = thread::Builder::new()
            .name(format!("playback-{}", sender))
            .spawn(move || {
                run_playback(sender, backend, thread_buffer, stop, frame_bytes, poll_interval)
            })?;

        Ok(Self {
            sender,
            buffer,
            thread: Some(thread),
        })
    }

    pub fn push(&self, frame: Vec<u8>) -> PushOutcome {
        self.buffer.lock().push(frame)
    }

    pub fn stats(&self) -> JitterBufferStats {
        self.buffer.lock().stats()
    }

    /// Whether the playback thread has exited
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the playback thread to exit
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Playback thread for client {} panicked", self.sender);
            }
        }
    }
}

fn run_playback(
    sender: ClientId,
    backend: Arc<dyn AudioBackend>,
    buffer: Arc<Mutex<JitterBuffer>>,
    stop: Arc<AtomicBool>,
    frame_bytes: usize,
    poll_interval: Duration,
) {
    let mut sink = match backend.open_sink(sender) {
        Ok(sink) => sink,
        Err(e) => {
            error!("Failed to open playback for client {}: {}", sender, e);
            return;
        }
    };
    let silence = vec![0u8; frame_bytes];

    while !stop.load(Ordering::SeqCst) {
        let next = buffer.lock().pop();
        match next {
            JitterBufferResult::Frame(frame) => {
                if let Err(e) = sink.write_frame(&frame) {
                    error!("Playback write failed for client {}: {}", sender, e);
                    break;
                }
            }
            JitterBufferResult::Filling => thread::sleep(poll_interval),
            JitterBufferResult::Underrun => {
                trace!("Underrun for client {}, playing silence", sender);
                if let Err(e) = sink.write_frame(&silence) {
                    error!("Playback write failed for client {}: {}", sender, e);
                    break;
                }
                thread::sleep(poll_interval);
            }
        }
    }

    buffer.lock().reset();
    debug!("Playback for client {} stopped", sender);
}

/// Sender id -> playback engine, created lazily on first audio
///
/// Frames are refused until `enable`; `stop_all` tears every engine down and
/// disables the registry again.
pub struct PlaybackRegistry {
    engines: HashMap<ClientId, PlaybackEngine>,
    backend: Arc<dyn AudioBackend>,
    config: PlaybackConfig,
    stop: Arc<AtomicBool>,
    enabled: bool,
}

impl PlaybackRegistry {
    pub fn new(backend: Arc<dyn AudioBackend>, config: PlaybackConfig) -> Self {
        Self {
            engines: HashMap::new(),
            backend,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            enabled: false,
        }
    }

    /// Start accepting frames
    pub fn enable(&mut self) {
        if !self.enabled {
            // Engines from an earlier generation keep the old, already-set flag
            self.stop = Arc::new(AtomicBool::new(false));
            self.enabled = true;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Queue a frame for `sender`, starting its engine on first use
    ///
    /// Returns `None` when the registry is disabled or the engine could not start.
    pub fn push(&mut self, sender: ClientId, frame: Vec<u8>) -> Option<PushOutcome> {
        if !self.enabled {
            trace!("Dropping frame from client {}: playback not running", sender);
            return None;
        }

        // A thread that lost its device exits on its own; start over with a fresh one
        if self
            .engines
            .get(&sender)
            .is_some_and(|engine| engine.is_finished())
        {
            if let Some(engine) = self.engines.remove(&sender) {
                warn!("Playback for client {} ended, restarting", sender);
                engine.join();
            }
        }

        if !self.engines.contains_key(&sender) {
            match PlaybackEngine::spawn(
                sender,
                self.backend.clone(),
                &self.config,
                self.stop.clone(),
            ) {
                Ok(engine) => {
                    info!("Started playback for client {}", sender);
                    self.engines.insert(sender, engine);
                }
                Err(e) => {
                    error!("Failed to start playback for client {}: {}", sender, e);
                    return None;
                }
            }
        }

        self.engines.get(&sender).map(|engine| engine.push(frame))
    }

    /// Senders with a live engine, in id order
    pub fn senders(&self) -> Vec<ClientId> {
        let mut senders: Vec<ClientId> = self.engines.keys().copied().collect();
        senders.sort();
        senders
    }

    pub fn stats(&self, sender: ClientId) -> Option<JitterBufferStats> {
        self.engines.get(&sender).map(|engine| engine.stats())
    }

    /// Signal every engine to stop and forget them
    ///
    /// Returns the engines so the caller may wait for their threads.
    pub fn stop_all(&mut self) -> Vec<PlaybackEngine> {
        self.stop.store(true, Ordering::SeqCst);
        self.enabled = false;
        if !self.engines.is_empty() {
            info!("Stopping {} playback engines", self.engines.len());
        }
        self.engines.drain().map(|(_, engine)| engine).collect()
    }

    /// Stop every engine and wait for its thread to release the device
    pub fn stop_and_wait(&mut self) {
        for engine in self.stop_all() {
            engine.join();
        }
    }
}

impl Drop for PlaybackRegistry {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
