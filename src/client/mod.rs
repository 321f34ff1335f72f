//! Voice client
//!
//! Streams the microphone to the relay and plays every other participant of
//! the room through its own jitter buffer and output.

mod dispatcher;
mod error;
mod jitter_buffer;
mod playback;
mod sender;
mod session;

pub use dispatcher::{ClientEvents, InboundDispatcher};
pub use error::ClientError;
pub use jitter_buffer::{
    JitterBuffer, JitterBufferConfig, JitterBufferResult, JitterBufferStats, OverflowPolicy,
    PushOutcome,
};
pub use playback::{PlaybackConfig, PlaybackEngine, PlaybackRegistry};
pub use sender::SenderPump;
pub use session::{ClientConfig, ClientSession};
