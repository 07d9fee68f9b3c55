//! Error taxonomy for the acquisition and synchronization core.
//!
//! Each type maps to one propagation policy:
//!
//! - [`DiscoveryError`] is per candidate and swallowed by the scanner.
//! - [`DeviceInitError`] aborts the run before any stimulus is shown.
//! - [`StreamControlError`] is logged and absorbed by the session.
//! - [`SessionError`] is returned by session calls after `release()`.
//! - [`AlignmentError`] is terminal for one epoch, not for the alignment pass.

use thiserror::Error;

/// Transport-level failure while probing a single candidate address
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("I/O error while probing: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial error while probing: {0}")]
    Serial(#[from] serialport::Error),

    #[error("unsupported host platform for port enumeration")]
    UnsupportedPlatform,
}

/// Failure while opening or configuring an acquisition device
#[derive(Debug, Error)]
pub enum DeviceInitError {
    #[error("transport {address} is held by another session")]
    Lock { address: String },

    #[error("serial error on {address}: {source}")]
    Serial {
        address: String,
        #[source]
        source: serialport::Error,
    },

    #[error("I/O error during device initialization: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration command {command:?} failed: {reason}")]
    Handshake { command: String, reason: String },
}

/// Non-fatal failure while starting or stopping the sample stream
#[derive(Debug, Error)]
pub enum StreamControlError {
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("producer thread panicked")]
    ProducerPanicked,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session has been released")]
    Closed,

    #[error(transparent)]
    Init(#[from] DeviceInitError),
}

/// Failure to place one logged event (or its window) on the sample grid
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AlignmentError {
    #[error("recording contains no samples")]
    EmptyRecording,

    #[error("nominal sampling rate must be positive, got {0}")]
    InvalidSamplingRate(f64),

    #[error("marker {marker}: timestamp {timestamp} is not a finite time")]
    NonFiniteTimestamp { marker: i32, timestamp: f64 },

    #[error(
        "marker {marker}: onset sample {index} is outside the recorded range [0, {sample_count})"
    )]
    OnsetOutOfRange {
        marker: i32,
        index: i64,
        sample_count: usize,
    },

    #[error(
        "marker {marker}: epoch window [{start}, {end}) exceeds the recorded range [0, {sample_count})"
    )]
    WindowOutOfRange {
        marker: i32,
        start: i64,
        end: i64,
        sample_count: usize,
    },

    #[error("epoch window is empty or inverted: tmin={tmin}s, tmax={tmax}s")]
    InvalidWindow { tmin: f64, tmax: f64 },
}
