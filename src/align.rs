//! Offline alignment of stimulus events to recorded samples
//!
//! The device clock and the presentation wall clock are separate clocks.
//! Alignment anchors on the first sample's device timestamp and maps each
//! event with
//!
//! ```text
//! onset_sample_index = floor((event.timestamp - first_sample.timestamp) * nominal_rate)
//! ```
//!
//! A single offset is assumed for the whole recording. Drift between the two
//! clocks is measured and reported by [`ClockDiagnostics`] but never
//! corrected.
//!
//! Failures are isolated per epoch: an event that cannot be placed lands in
//! [`AlignmentReport::rejected`] and the remaining events are still aligned.

use ndarray::{s, Array2};
use serde::Serialize;
use serde_json::json;

use crate::error::AlignmentError;
use crate::record::stimulus_log::StimulusEvent;
use crate::record::SampleTable;

/// Relative rate deviation above which drift is flagged
pub const DRIFT_TOLERANCE: f64 = 0.01;

// Absorbs float error from subtracting two unix-epoch timestamps
const ONSET_EPSILON_SAMPLES: f64 = 1e-3;

/// Epoch bounds in seconds relative to onset
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochWindow {
    pub tmin: f64,
    pub tmax: f64,
}

impl Default for EpochWindow {
    fn default() -> Self {
        Self {
            tmin: -0.2,
            tmax: 0.8,
        }
    }
}

impl EpochWindow {
    /// Window offsets in samples, rounded to the nearest sample
    pub fn to_samples(&self, sampling_rate: f64) -> Result<(i64, i64), AlignmentError> {
        validate_rate(sampling_rate)?;
        let start = (self.tmin * sampling_rate).round() as i64;
        let end = (self.tmax * sampling_rate).round() as i64;
        if !self.tmin.is_finite() || !self.tmax.is_finite() || end <= start {
            return Err(AlignmentError::InvalidWindow {
                tmin: self.tmin,
                tmax: self.tmax,
            });
        }
        Ok((start, end))
    }
}

/// One event placed on the sample grid
///
/// `start..end` is half-open: the sample at `onset + round(tmax * rate)` is
/// not part of the epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Epoch {
    pub marker: i32,
    pub trial: usize,
    pub onset: usize,
    pub start: usize,
    pub end: usize,
}

impl Epoch {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub marker: i32,
    pub trial: usize,
    pub reason: String,
    #[serde(skip)]
    pub error: AlignmentError,
}

/// Nominal vs. observed sampling rate of a recording
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClockDiagnostics {
    pub nominal_rate: f64,
    /// `(n - 1) / (t_last - t_first)`; `None` with fewer than two samples
    pub effective_rate: Option<f64>,
    pub duration: f64,
    pub relative_deviation: Option<f64>,
}

impl ClockDiagnostics {
    pub fn from_timestamps(timestamps: &[f64], nominal_rate: f64) -> Self {
        let duration = match (timestamps.first(), timestamps.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        };
        let effective_rate = if timestamps.len() >= 2 && duration > 0.0 {
            Some((timestamps.len() - 1) as f64 / duration)
        } else {
            None
        };
        let relative_deviation = effective_rate
            .filter(|_| nominal_rate > 0.0)
            .map(|rate| (rate - nominal_rate).abs() / nominal_rate);

        Self {
            nominal_rate,
            effective_rate,
            duration,
            relative_deviation,
        }
    }

    /// Whether a single-offset alignment is likely to be biased
    pub fn drift_suspected(&self) -> bool {
        self.relative_deviation
            .is_some_and(|deviation| deviation > DRIFT_TOLERANCE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignmentReport {
    /// Device timestamp of the first sample
    pub anchor: f64,
    pub sampling_rate: f64,
    pub window: EpochWindow,
    pub sample_count: usize,
    pub epochs: Vec<Epoch>,
    pub rejected: Vec<Rejection>,
    pub diagnostics: ClockDiagnostics,
}

impl AlignmentReport {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "anchor_timestamp": self.anchor,
            "sampling_rate": self.sampling_rate,
            "tmin": self.window.tmin,
            "tmax": self.window.tmax,
            "sample_count": self.sample_count,
            "accepted_markers": self.epochs.iter().map(|e| e.marker).collect::<Vec<_>>(),
            "onsets": self.epochs.iter().map(|e| e.onset).collect::<Vec<_>>(),
            "rejected": self.rejected,
            "effective_rate": self.diagnostics.effective_rate,
            "rate_deviation": self.diagnostics.relative_deviation,
            "drift_suspected": self.diagnostics.drift_suspected(),
            "drift_corrected": false,
            "aligned_at": chrono::Utc::now().to_rfc3339(),
        })
    }
}

fn validate_rate(sampling_rate: f64) -> Result<(), AlignmentError> {
    if sampling_rate.is_finite() && sampling_rate > 0.0 {
        Ok(())
    } else {
        Err(AlignmentError::InvalidSamplingRate(sampling_rate))
    }
}

/// Sample index of an event relative to the first sample
///
/// Indices outside `[0, sample_count)` are reported, never clamped. So are
/// NaN or infinite times, which would otherwise cast to a valid index.
pub fn onset_sample_index(
    marker: i32,
    event_timestamp: f64,
    anchor: f64,
    sampling_rate: f64,
    sample_count: usize,
) -> Result<usize, AlignmentError> {
    validate_rate(sampling_rate)?;
    for timestamp in [event_timestamp, anchor] {
        if !timestamp.is_finite() {
            return Err(AlignmentError::NonFiniteTimestamp { marker, timestamp });
        }
    }
    let onset_seconds = event_timestamp - anchor;
    let index = (onset_seconds * sampling_rate + ONSET_EPSILON_SAMPLES).floor() as i64;

    if index < 0 || index >= sample_count as i64 {
        return Err(AlignmentError::OnsetOutOfRange {
            marker,
            index,
            sample_count,
        });
    }
    Ok(index as usize)
}

/// Window for one event, failing when either bound leaves the recording
pub fn epoch_bounds(
    marker: i32,
    onset: usize,
    window_samples: (i64, i64),
    sample_count: usize,
) -> Result<(usize, usize), AlignmentError> {
    let start = onset as i64 + window_samples.0;
    let end = onset as i64 + window_samples.1;
    if start < 0 || end > sample_count as i64 {
        return Err(AlignmentError::WindowOutOfRange {
            marker,
            start,
            end,
            sample_count,
        });
    }
    Ok((start as usize, end as usize))
}

fn align_event(
    event: &StimulusEvent,
    anchor: f64,
    sampling_rate: f64,
    window_samples: (i64, i64),
    sample_count: usize,
) -> Result<Epoch, AlignmentError> {
    let onset = onset_sample_index(
        event.marker,
        event.timestamp,
        anchor,
        sampling_rate,
        sample_count,
    )?;
    let (start, end) = epoch_bounds(event.marker, onset, window_samples, sample_count)?;
    Ok(Epoch {
        marker: event.marker,
        trial: event.trial,
        onset,
        start,
        end,
    })
}

/// Align every logged event against a recording
///
/// Only recording-wide problems (no samples, bad rate, bad window) fail the
/// whole pass.
pub fn align_events(
    timestamps: &[f64],
    sampling_rate: f64,
    events: &[StimulusEvent],
    window: EpochWindow,
) -> Result<AlignmentReport, AlignmentError> {
    let anchor = *timestamps.first().ok_or(AlignmentError::EmptyRecording)?;
    let window_samples = window.to_samples(sampling_rate)?;
    let sample_count = timestamps.len();

    let diagnostics = ClockDiagnostics::from_timestamps(timestamps, sampling_rate);
    if diagnostics.drift_suspected() {
        tracing::warn!(
            "Effective rate {:.3} Hz differs from nominal {} Hz by more than {:.0}%; onsets assume no drift",
            diagnostics.effective_rate.unwrap_or_default(),
            sampling_rate,
            DRIFT_TOLERANCE * 100.0
        );
    }

    let mut epochs = Vec::with_capacity(events.len());
    let mut rejected = Vec::new();
    for event in events {
        match align_event(event, anchor, sampling_rate, window_samples, sample_count) {
            Ok(epoch) => epochs.push(epoch),
            Err(error) => {
                tracing::warn!("Trial {} rejected: {}", event.trial, error);
                rejected.push(Rejection {
                    marker: event.marker,
                    trial: event.trial,
                    reason: error.to_string(),
                    error,
                });
            }
        }
    }

    Ok(AlignmentReport {
        anchor,
        sampling_rate,
        window,
        sample_count,
        epochs,
        rejected,
        diagnostics,
    })
}

/// [`align_events`] over a loaded record, using its nominal rate unless overridden
pub fn align_table(
    table: &SampleTable,
    events: &[StimulusEvent],
    window: EpochWindow,
    rate_override: Option<f64>,
) -> Result<AlignmentReport, AlignmentError> {
    let rate = rate_override.unwrap_or(table.sampling_rate);
    align_events(&table.timestamps, rate, events, window)
}

/// Copy the `[channels, start..end]` slice of each accepted epoch
pub fn extract_epochs(table: &SampleTable, report: &AlignmentReport) -> Vec<(i32, Array2<f64>)> {
    report
        .epochs
        .iter()
        .map(|epoch| {
            (
                epoch.marker,
                table.data.slice(s![.., epoch.start..epoch.end]).to_owned(),
            )
        })
        .collect()
}
