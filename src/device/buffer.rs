use std::sync::{Mutex, MutexGuard, PoisonError};

use super::SampleFrame;

/// Pull-based sample buffer shared between one producer and one reader
///
/// The producer (device thread) appends through [`FrameBuffer::ingest`]; the
/// presentation side takes everything buffered so far with
/// [`FrameBuffer::drain`]. Frames keep ingestion order and every frame gets a
/// strictly increasing sequence number, so the concatenation of all drains is
/// exactly the ingested stream.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    state: Mutex<BufferState>,
}

#[derive(Debug, Default)]
struct BufferState {
    frames: Vec<SampleFrame>,
    next_sequence: u64,
    last_timestamp: Option<f64>,
    non_monotonic: u64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // A panicking producer must not take the recorded frames with it
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one reading; returns the sequence number assigned to it
    pub fn ingest(&self, timestamp: f64, channels: Vec<f64>) -> u64 {
        let mut state = self.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        if let Some(last) = state.last_timestamp
            && timestamp <= last
        {
            state.non_monotonic += 1;
            if state.non_monotonic <= 5 {
                tracing::warn!(
                    "Device timestamp did not advance at sequence {}: {:.6} <= {:.6}",
                    sequence,
                    timestamp,
                    last
                );
            }
        }
        state.last_timestamp = Some(timestamp);

        state.frames.push(SampleFrame {
            sequence,
            timestamp,
            channels,
        });
        sequence
    }

    /// Remove and return every frame buffered since the previous drain
    pub fn drain(&self) -> Vec<SampleFrame> {
        std::mem::take(&mut self.lock().frames)
    }

    /// Number of frames waiting to be drained
    pub fn pending(&self) -> usize {
        self.lock().frames.len()
    }

    /// Total number of frames ever ingested
    pub fn ingested(&self) -> u64 {
        self.lock().next_sequence
    }

    /// Count of frames whose device timestamp did not exceed its predecessor's
    pub fn non_monotonic_count(&self) -> u64 {
        self.lock().non_monotonic
    }
}
