//! Acquisition session lifecycle
//!
//! ```text
//! Unopened -> Prepared -> Configured -> Streaming <-> Stopped -> Released
//!                 \________(synthetic)______/
//! ```
//!
//! A [`Session`] exclusively owns one device for its whole life. Opening
//! failures are fatal and surface as [`DeviceInitError`]; start/stop
//! failures on an opened session are logged and absorbed. Release happens
//! exactly once, either explicitly or when the session is dropped.

use std::sync::Arc;

use serde::Serialize;

use crate::device::{
    cyton::CytonDevice, synthetic::SyntheticDevice, AcquisitionDevice, DeviceKind, FrameBuffer,
    SampleFrame,
};
use crate::error::{DeviceInitError, SessionError};
use crate::scanner::ScanConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Unopened,
    Prepared,
    Configured,
    Streaming,
    Stopped,
    Released,
}

/// What the session should be opened on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    Hardware(String),
    Synthetic { channels: usize },
}

impl DataSource {
    /// Hardware when discovery found a port, synthetic otherwise
    pub fn from_discovery(address: Option<String>, synthetic_channels: usize) -> Self {
        match address {
            Some(address) => DataSource::Hardware(address),
            None => DataSource::Synthetic {
                channels: synthetic_channels,
            },
        }
    }
}

/// Exclusive owner of one acquisition device
///
/// Every stream and buffer operation fails with [`SessionError::Closed`]
/// once the session is released. The read-only accessors (`state`, `kind`,
/// `address`, `channel_count`, `sampling_rate`, `config_responses`) keep
/// answering, so a released session can still be described in logs and run
/// metadata.
pub struct Session {
    device: Box<dyn AcquisitionDevice>,
    buffer: Arc<FrameBuffer>,
    state: SessionState,
    config_responses: Vec<String>,
}

impl Session {
    /// Open a session on the given data source
    pub fn open(source: DataSource, scan_config: &ScanConfig) -> Result<Self, DeviceInitError> {
        let device: Box<dyn AcquisitionDevice> = match source {
            DataSource::Hardware(address) => Box::new(CytonDevice::new(address, scan_config.clone())),
            DataSource::Synthetic { channels } => Box::new(SyntheticDevice::new(channels)),
        };
        Self::open_device(device)
    }

    /// Prepare and, for real hardware, configure an arbitrary device
    pub fn open_device(mut device: Box<dyn AcquisitionDevice>) -> Result<Self, DeviceInitError> {
        let mut state = SessionState::Unopened;

        if let Err(e) = device.prepare() {
            device.release();
            return Err(e);
        }
        state = advance(state, SessionState::Prepared);

        let mut config_responses = Vec::new();
        if device.kind().requires_configuration() {
            match device.configure() {
                Ok(responses) => config_responses = responses,
                Err(e) => {
                    device.release();
                    return Err(e);
                }
            }
            state = advance(state, SessionState::Configured);
        }

        tracing::info!(
            "Session open on {} ({} channels, {} Hz)",
            device.address().unwrap_or(device.kind().name()),
            device.channel_count(),
            device.sampling_rate()
        );

        Ok(Self {
            device,
            buffer: Arc::new(FrameBuffer::new()),
            state,
            config_responses,
        })
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Released {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn kind(&self) -> DeviceKind {
        self.device.kind()
    }

    pub fn address(&self) -> Option<&str> {
        self.device.address()
    }

    pub fn channel_count(&self) -> usize {
        self.device.channel_count()
    }

    pub fn sampling_rate(&self) -> f64 {
        self.device.sampling_rate()
    }

    /// Raw responses to the configuration commands, in order
    pub fn config_responses(&self) -> &[String] {
        &self.config_responses
    }

    /// Begin buffering. Ignored when already streaming.
    pub fn start_stream(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.state == SessionState::Streaming && self.device.is_streaming() {
            return Ok(());
        }

        if let Err(e) = self.device.start_stream(self.buffer.clone()) {
            tracing::warn!("Failed to start stream (continuing): {}", e);
        }
        self.sync_stream_state();
        Ok(())
    }

    /// Halt ingestion; undrained frames stay buffered. Ignored when not streaming.
    pub fn stop_stream(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.state != SessionState::Streaming {
            return Ok(());
        }

        if let Err(e) = self.device.stop_stream() {
            tracing::warn!("Failed to stop stream (continuing): {}", e);
        }
        self.sync_stream_state();
        Ok(())
    }

    /// Follow what the device reports, not what was requested
    fn sync_stream_state(&mut self) {
        let streaming = self.device.is_streaming();
        match (self.state, streaming) {
            (SessionState::Streaming, false) => {
                self.state = advance(self.state, SessionState::Stopped)
            }
            (state, true) if state != SessionState::Streaming => {
                self.state = advance(state, SessionState::Streaming)
            }
            _ => {}
        }
    }

    /// Take every frame buffered since the previous call
    ///
    /// Requires `&mut self`, so two drains can never be in flight at once.
    pub fn read_buffered(&mut self) -> Result<Vec<SampleFrame>, SessionError> {
        self.ensure_open()?;
        Ok(self.buffer.drain())
    }

    /// Frames currently waiting in the buffer
    pub fn pending(&self) -> Result<usize, SessionError> {
        self.ensure_open()?;
        Ok(self.buffer.pending())
    }

    /// Close the transport. Safe to call any number of times.
    pub fn release(&mut self) {
        if self.state == SessionState::Released {
            return;
        }
        if let Err(e) = self.stop_stream() {
            tracing::debug!("Stop during release skipped: {}", e);
        }
        self.device.release();
        self.state = SessionState::Released;
        tracing::info!(
            "Session released ({} frames acquired, {} left undrained)",
            self.buffer.ingested(),
            self.buffer.pending()
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

fn advance(from: SessionState, to: SessionState) -> SessionState {
    tracing::debug!("Session {:?} -> {:?}", from, to);
    to
}
