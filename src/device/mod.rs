//! Acquisition devices
//!
//! Callers depend only on [`AcquisitionDevice`]. Two implementations exist:
//! [`cyton::CytonDevice`] for the serial OpenBCI board and
//! [`synthetic::SyntheticDevice`] for runs where no board was discovered.
//! Both push decoded readings into a shared [`FrameBuffer`] from their own
//! producer thread.

pub mod buffer;
pub mod cyton;
pub mod synthetic;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{DeviceInitError, StreamControlError};

pub use buffer::FrameBuffer;

/// Nominal sampling rate shared by the Cyton board and the synthetic device
pub const DEFAULT_SAMPLING_RATE: f64 = 250.0;

/// One timestamped multi-channel reading
#[derive(Debug, Clone, PartialEq)]
pub struct SampleFrame {
    /// Position in acquisition order, assigned by the buffer
    pub sequence: u64,
    /// Device-side timestamp in unix seconds
    pub timestamp: f64,
    pub channels: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Cyton,
    Synthetic,
}

impl DeviceKind {
    /// Whether the board expects the configuration handshake after opening
    pub fn requires_configuration(&self) -> bool {
        matches!(self, DeviceKind::Cyton)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::Cyton => "OpenBCI Cyton",
            DeviceKind::Synthetic => "Synthetic Board",
        }
    }
}

/// Capability interface of a data source owned by a session
pub trait AcquisitionDevice: Send {
    fn kind(&self) -> DeviceKind;

    /// Transport address this device holds, if any
    fn address(&self) -> Option<&str>;

    fn channel_count(&self) -> usize;

    fn sampling_rate(&self) -> f64;

    /// Whether a producer is currently feeding a sink
    fn is_streaming(&self) -> bool;

    /// Acquire the transport
    fn prepare(&mut self) -> Result<(), DeviceInitError>;

    /// Send the board configuration; returns each command's raw response
    fn configure(&mut self) -> Result<Vec<String>, DeviceInitError> {
        Ok(Vec::new())
    }

    /// Begin producing frames into `sink`
    fn start_stream(&mut self, sink: Arc<FrameBuffer>) -> Result<(), StreamControlError>;

    /// Halt the producer; frames already in `sink` stay there
    fn stop_stream(&mut self) -> Result<(), StreamControlError>;

    /// Close the transport. Must be safe to call more than once.
    fn release(&mut self);
}

/// Current host wall-clock time in unix seconds
pub fn wall_clock_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Handle to a background producer thread with a cooperative stop flag
pub(crate) struct ProducerThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ProducerThread {
    pub(crate) fn spawn<F>(name: &str, body: F) -> Result<Self, StreamControlError>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(stop_clone))?;
        Ok(Self { stop, handle })
    }

    /// Signal the producer and wait for it to exit
    pub(crate) fn stop(self) -> Result<(), StreamControlError> {
        self.stop.store(true, Ordering::SeqCst);
        self.handle
            .join()
            .map_err(|_| StreamControlError::ProducerPanicked)
    }
}
