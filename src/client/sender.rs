//! Microphone pump
//!
//! Reads fixed-size frames from the capture device on a dedicated thread and
//! queues them for the connection writer. The server tags them with this
//! client's identity; nothing here claims one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::audio::AudioBackend;
use crate::protocol::ClientFrame;

use super::error::ClientError;

/// Handle on a running microphone pump
pub struct SenderPump {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<u64>>,
}

impl SenderPump {
    /// Open the capture device on a new thread and start forwarding frames
    pub fn spawn(
        backend: Arc<dyn AudioBackend>,
        frame_bytes: usize,
        outbound: mpsc::Sender<ClientFrame>,
    ) -> Result<Self, ClientError> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let thread = thread::Builder::new()
            .name("sender-pump".to_string())
            .spawn(move || run_pump(backend, frame_bytes, outbound, thread_stop))?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Ask the pump to exit after its current frame
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop and wait for the thread; returns the number of frames sent
    pub fn join(mut self) -> u64 {
        self.stop();
        match self.thread.take().map(|t| t.join()) {
            Some(Ok(frames)) => frames,
            Some(Err(_)) => {
                error!("Sender pump thread panicked");
                0
            }
            None => 0,
        }
    }
}

impl Drop for SenderPump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_pump(
    backend: Arc<dyn AudioBackend>,
    frame_bytes: usize,
    outbound: mpsc::Sender<ClientFrame>,
    stop: Arc<AtomicBool>,
) -> u64 {
    let mut source = match backend.open_source() {
        Ok(source) => source,
        Err(e) => {
            error!("Failed to open microphone: {}", e);
            return 0;
        }
    };
    info!("Microphone streaming started");

    let mut frames_sent = 0u64;
    while !stop.load(Ordering::SeqCst) {
        let frame = match source.read_frame(frame_bytes) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Microphone read failed: {}", e);
                break;
            }
        };
        // A frame finished after a stop request must not follow a LEAVE
        if frame.is_empty() || stop.load(Ordering::SeqCst) {
            continue;
        }

        // Fails once the connection writer is gone; no retry
        if outbound.blocking_send(ClientFrame::Audio(frame)).is_err() {
            debug!("Connection closed, stopping microphone pump");
            break;
        }

        frames_sent += 1;
        if frames_sent % 100 == 0 {
            debug!("Sent {} audio frames", frames_sent);
        }
    }

    info!("Microphone streaming stopped after {} frames", frames_sent);
    frames_sent
}
