//! Capture buffer for recorded audio frames
//!
//! The realtime callback appends interleaved PCM16 samples into a
//! [`CaptureSink`]; samples are cut into fixed-length [`Frame`]s tagged with
//! their arrival sequence. Stopping a capture detaches the whole buffer in one
//! swap, so the producer never shares mutable data with the consumer.

use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Default frame length in samples per channel.
pub const DEFAULT_FRAME_SAMPLES: usize = 1024;

/// A block of interleaved PCM16 samples with metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Interleaved PCM16 samples (`frame_samples * channels` long, except the final flush)
    pub samples: Vec<i16>,
    /// Interleaved channel count
    pub channels: u16,
    /// Arrival order within the capture (monotonically increasing from 0)
    pub sequence: u64,
    /// Monotonic timestamp when the frame was completed
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(samples: Vec<i16>, channels: u16, sequence: u64) -> Self {
        Self {
            samples,
            channels,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Number of sample frames (samples per channel) in this block
    pub fn sample_frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Duration of this frame in milliseconds
    pub fn duration_ms(&self, sample_rate: u32) -> u64 {
        if sample_rate == 0 {
            return 0;
        }
        (self.sample_frames() as u64 * 1000) / sample_rate as u64
    }
}

/// Ordered, append-only accumulation of frames for one capture.
///
/// Thread-safety: this struct is NOT internally synchronized. The capture
/// engine owns it through a [`CaptureSink`].
#[derive(Debug)]
pub struct CaptureBuffer {
    frames: Vec<Frame>,
    pending: Vec<i16>,
    frame_len: usize,
    channels: u16,
    next_sequence: u64,
}

impl CaptureBuffer {
    /// Create an empty buffer producing frames of `frame_samples` per channel
    pub fn new(frame_samples: usize, channels: u16) -> Self {
        let channels = channels.max(1);
        let frame_len = frame_samples.max(1) * channels as usize;
        Self {
            frames: Vec::new(),
            pending: Vec::with_capacity(frame_len),
            frame_len,
            channels,
            next_sequence: 0,
        }
    }

    /// Append interleaved samples, completing as many frames as they fill.
    /// Returns the number of frames completed by this call.
    pub fn push_samples(&mut self, samples: &[i16]) -> usize {
        let mut completed = 0;
        let mut rest = samples;

        while !rest.is_empty() {
            let room = self.frame_len - self.pending.len();
            let take = room.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_len {
                let block = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_len));
                self.seal(block);
                completed += 1;
            }
        }

        completed
    }

    /// Append an already-complete frame of samples (used by tests and replays).
    /// Returns the sequence number assigned to it.
    pub fn push_frame(&mut self, samples: Vec<i16>) -> u64 {
        self.seal(samples)
    }

    fn seal(&mut self, samples: Vec<i16>) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.frames.push(Frame::new(samples, self.channels, sequence));
        sequence
    }

    /// Consume the buffer, flushing any partial block as a final short frame
    pub fn into_frames(mut self) -> Vec<Frame> {
        if !self.pending.is_empty() {
            let block = std::mem::take(&mut self.pending);
            self.seal(block);
        }
        self.frames
    }

    /// Number of completed frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.pending.is_empty()
    }

    /// Sequence number that will be assigned to the next frame
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

/// Shared slot between the realtime producer and the capture engine.
///
/// The slot holds `Some(buffer)` only while a capture is armed. The producer
/// appends under a short critical section; [`CaptureSink::detach`] swaps the
/// slot back to `None` and hands the buffer to the caller.
#[derive(Debug, Clone, Default)]
pub struct CaptureSink {
    slot: Arc<Mutex<Option<CaptureBuffer>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh buffer. Returns false if a capture was already armed.
    pub fn arm(&self, frame_samples: usize, channels: u16) -> bool {
        let Ok(mut slot) = self.slot.lock() else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(CaptureBuffer::new(frame_samples, channels));
        true
    }

    /// Producer side: copy samples into the armed buffer.
    /// Samples arriving while disarmed are dropped.
    pub fn append(&self, samples: &[i16]) {
        if let Ok(mut slot) = self.slot.lock() {
            if let Some(buffer) = slot.as_mut() {
                buffer.push_samples(samples);
            }
        }
    }

    /// Detach the armed buffer, leaving the slot disarmed
    pub fn detach(&self) -> Option<CaptureBuffer> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }
}
