//! Client session
//!
//! Owns the TCP connection to the relay and wires the pieces together: a
//! writer task draining the outbound queue, the inbound dispatcher task, the
//! microphone pump and the per-sender playback registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{AudioBackend, AudioConfig};
use crate::protocol::{ClientCommand, ClientFrame, ClientId, Framing};

use super::dispatcher::{ClientEvents, InboundDispatcher};
use super::error::ClientError;
use super::jitter_buffer::{JitterBufferConfig, JitterBufferStats};
use super::playback::{PlaybackConfig, PlaybackRegistry};
use super::sender::SenderPump;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay address (host:port)
    pub server_addr: String,
    /// How microphone frames are framed on the wire
    pub framing: Framing,
    pub audio: AudioConfig,
    pub jitter: JitterBufferConfig,
    /// Playback poll interval while filling or underrunning
    pub poll_interval: Duration,
    /// Frames queued for the socket before the microphone pump blocks
    pub outbound_queue: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:5000".to_string(),
            framing: Framing::default(),
            audio: AudioConfig::default(),
            jitter: JitterBufferConfig::default(),
            poll_interval: Duration::from_millis(10),
            outbound_queue: 32,
        }
    }
}

impl ClientConfig {
    fn playback(&self) -> PlaybackConfig {
        PlaybackConfig {
            frame_bytes: self.audio.frame_bytes(),
            poll_interval: self.poll_interval,
            jitter: self.jitter.clone(),
        }
    }
}

/// A live connection to the relay
pub struct ClientSession {
    config: ClientConfig,
    backend: Arc<dyn AudioBackend>,
    local_addr: SocketAddr,
    outbound: Option<mpsc::Sender<ClientFrame>>,
    playback: Arc<Mutex<PlaybackRegistry>>,
    pump: Option<SenderPump>,
    writer: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl ClientSession {
    /// Connect and start reading the server stream
    ///
    /// Control lines reach `events` right away; audio is dropped until
    /// `start_streaming`.
    pub async fn connect(
        config: ClientConfig,
        backend: Arc<dyn AudioBackend>,
        events: Arc<dyn ClientEvents>,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(&config.server_addr).await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        let local_addr = stream.local_addr()?;
        info!("Connected to {} from {}", config.server_addr, local_addr);

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(config.outbound_queue.max(1));
        let writer = tokio::spawn(run_writer(write_half, rx, config.framing));

        let playback = Arc::new(Mutex::new(PlaybackRegistry::new(
            backend.clone(),
            config.playback(),
        )));
        let dispatcher =
            InboundDispatcher::new(BufReader::new(read_half), events, playback.clone());
        let dispatcher = tokio::spawn(async move {
            if let Err(e) = dispatcher.run().await {
                debug!("Dispatcher ended: {}", e);
            }
        });

        Ok(Self {
            config,
            backend,
            local_addr,
            outbound: Some(tx),
            playback,
            pump: None,
            writer: Some(writer),
            dispatcher: Some(dispatcher),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the server stream is still being read
    pub fn is_connected(&self) -> bool {
        self.dispatcher.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Queue a control command
    pub async fn send_command(&self, command: ClientCommand) -> Result<(), ClientError> {
        self.send(ClientFrame::Command(command)).await
    }

    /// Queue one audio frame, bypassing the microphone
    pub async fn send_audio(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        self.send(ClientFrame::Audio(frame)).await
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), ClientError> {
        let outbound = self.outbound.as_ref().ok_or(ClientError::ConnectionClosed)?;
        outbound
            .send(frame)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Accept incoming audio and start the microphone pump
    ///
    /// Calling it again while streaming is a no-op.
    pub fn start_streaming(&mut self) -> Result<(), ClientError> {
        let outbound = self.outbound.clone().ok_or(ClientError::ConnectionClosed)?;
        self.playback.lock().enable();

        if self.pump.as_ref().is_some_and(|pump| pump.is_running()) {
            return Ok(());
        }
        let pump = SenderPump::spawn(
            self.backend.clone(),
            self.config.audio.frame_bytes(),
            outbound,
        )?;
        self.pump = Some(pump);
        Ok(())
    }

    /// Stop the microphone and every playback engine
    ///
    /// Returns once the microphone thread has exited, so nothing it captured can
    /// reach the socket after this.
    pub async fn stop_streaming(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.stop();
            match tokio::task::spawn_blocking(move || pump.join()).await {
                Ok(frames) => debug!("Microphone pump joined after {} frames", frames),
                Err(e) => warn!("Failed to join microphone pump: {}", e),
            }
        }
        let engines = self.playback.lock().stop_all();
        debug!("Stopped streaming ({} playback engines)", engines.len());
    }

    pub fn is_streaming(&self) -> bool {
        self.playback.lock().is_enabled()
    }

    /// Leave the current room and stop streaming
    ///
    /// The microphone is stopped first so that `LEAVE` is the last thing the
    /// server reads from this room.
    pub async fn leave(&mut self) -> Result<(), ClientError> {
        self.stop_streaming().await;
        self.send_command(ClientCommand::Leave).await
    }

    /// Senders currently being played, in id order
    pub fn active_senders(&self) -> Vec<ClientId> {
        self.playback.lock().senders()
    }

    pub fn playback_stats(&self, sender: ClientId) -> Option<JitterBufferStats> {
        self.playback.lock().stats(sender)
    }

    /// Flush queued frames and disconnect
    pub async fn close(mut self) {
        self.stop_streaming().await;
        self.outbound = None;

        if let Some(writer) = self.writer.take() {
            let abort = writer.abort_handle();
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
                warn!("Outbound queue did not drain, dropping it");
                abort.abort();
            }
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
        self.playback.lock().stop_all();
        info!("Disconnected from {}", self.config.server_addr);
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.stop();
        }
        self.playback.lock().stop_all();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
    }
}

/// Drain the outbound queue onto the socket
///
/// Ends once every sender is gone or a write fails; the write half is shut down
/// so the server sees end of stream.
async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<ClientFrame>,
    framing: Framing,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = frame.write_to(&mut writer, framing).await {
            warn!("Write to server failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
