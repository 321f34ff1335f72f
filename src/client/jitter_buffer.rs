//! Per-sender jitter buffer
//!
//! A FIFO of whole audio frames. Playback waits for a fill threshold once, then
//! drains one frame per device period; an empty queue after that is an underrun.
//! The queue depth is bounded and the overflow policy decides which frame goes.

use std::collections::VecDeque;

/// Which frame to discard when a push would exceed `max_depth`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the frame at the head of the queue, keeping latency bounded
    #[default]
    DropOldest,
    /// Refuse the incoming frame
    DropNewest,
}

/// Configuration for the jitter buffer
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    /// Frames queued before playback starts (default: 2, must be >= 1)
    pub fill_threshold: usize,
    /// Maximum queued frames (default: 8)
    pub max_depth: usize,
    /// What to drop once `max_depth` is reached
    pub overflow: OverflowPolicy,
}

impl JitterBufferConfig {
    /// Validate and normalize the configuration
    ///
    /// - fill_threshold >= 1
    /// - max_depth >= fill_threshold
    pub fn validated(self) -> Self {
        let fill_threshold = self.fill_threshold.max(1);
        Self {
            fill_threshold,
            max_depth: self.max_depth.max(fill_threshold),
            overflow: self.overflow,
        }
    }
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            fill_threshold: 2,
            max_depth: 8,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Result from popping the jitter buffer
#[derive(Debug, PartialEq, Eq)]
pub enum JitterBufferResult {
    /// Oldest queued frame
    Frame(Vec<u8>),
    /// Still below the fill threshold; emit nothing
    Filling,
    /// Playing but empty; emit silence
    Underrun,
}

/// Result of pushing a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full and its oldest frame was discarded
    DroppedOldest,
    /// The queue was full and the pushed frame was discarded
    DroppedNewest,
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitterBufferStats {
    pub frames_received: u64,
    pub frames_played: u64,
    pub frames_dropped: u64,
    pub underruns: u64,
    pub depth: usize,
}

/// FIFO jitter buffer for one remote sender
pub struct JitterBuffer {
    frames: VecDeque<Vec<u8>>,
    config: JitterBufferConfig,
    /// Whether the fill threshold has been reached
    playing: bool,
    frames_received: u64,
    frames_played: u64,
    frames_dropped: u64,
    underruns: u64,
}

impl JitterBuffer {
    /// Create a new jitter buffer with default configuration
    pub fn new() -> Self {
        Self::with_config(JitterBufferConfig::default())
    }

    /// Create a new jitter buffer with custom configuration
    ///
    /// The configuration is validated to ensure sensible values.
    pub fn with_config(config: JitterBufferConfig) -> Self {
        let config = config.validated();
        Self {
            frames: VecDeque::with_capacity(config.max_depth),
            config,
            playing: false,
            frames_received: 0,
            frames_played: 0,
            frames_dropped: 0,
            underruns: 0,
        }
    }

    /// Append an arrived frame at the tail
    pub fn push(&mut self, frame: Vec<u8>) -> PushOutcome {
        self.frames_received += 1;

        if self.frames.len() < self.config.max_depth {
            self.frames.push_back(frame);
            return PushOutcome::Queued;
        }

        self.frames_dropped += 1;
        match self.config.overflow {
            OverflowPolicy::DropOldest => {
                self.frames.pop_front();
                self.frames.push_back(frame);
                PushOutcome::DroppedOldest
            }
            OverflowPolicy::DropNewest => PushOutcome::DroppedNewest,
        }
    }

    /// Take the next frame due for playback
    pub fn pop(&mut self) -> JitterBufferResult {
        if !self.playing {
            if self.frames.len() < self.config.fill_threshold {
                return JitterBufferResult::Filling;
            }
            self.playing = true;
        }

        match self.frames.pop_front() {
            Some(frame) => {
                self.frames_played += 1;
                JitterBufferResult::Frame(frame)
            }
            None => {
                self.underruns += 1;
                JitterBufferResult::Underrun
            }
        }
    }

    /// Get current buffer depth in frames
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Check if the fill phase is over
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            frames_received: self.frames_received,
            frames_played: self.frames_played,
            frames_dropped: self.frames_dropped,
            underruns: self.underruns,
            depth: self.depth(),
        }
    }

    /// Discard queued frames and return to the fill phase
    pub fn reset(&mut self) {
        self.frames.clear();
        self.playing = false;
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new()
    }
}
