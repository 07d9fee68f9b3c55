//! Out-of-band marker publishing
//!
//! Markers go out on their own channel (an LSL outlet by default) with no
//! clock shared with the acquisition device. [`MarkerChannel::publish`] only
//! enqueues the id; a dedicated thread owns the outlet and pushes it, so a
//! slow or absent subscriber can never stall presentation timing.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::Result;
use lsl::Pushable;
use serde::Serialize;

/// Marker published when the baseline window opens
pub const BASELINE_START: i32 = 999;
/// Marker published when the baseline window closes
pub const BASELINE_END: i32 = 1000;

/// Marker id of a trial onset (trials are zero-based)
pub fn trial_marker(trial_index: usize) -> i32 {
    trial_index as i32 + 1
}

/// Largest trial count whose markers stay clear of the baseline sentinels
pub const MAX_TRIALS: usize = (BASELINE_START - 1) as usize;

/// Sink that actually delivers marker ids to subscribers
pub trait MarkerOutlet {
    fn push(&mut self, marker: i32) -> Result<()>;
}

/// LSL outlet settings
#[derive(Debug, Clone, Serialize)]
pub struct MarkerStreamConfig {
    pub name: String,
    pub stream_type: String,
    pub source_id: String,
}

impl Default for MarkerStreamConfig {
    fn default() -> Self {
        Self {
            name: "Markers".to_string(),
            stream_type: "Markers".to_string(),
            source_id: "marker_stream".to_string(),
        }
    }
}

/// Irregular-rate single-channel int32 LSL stream
pub struct LslMarkerOutlet {
    outlet: lsl::StreamOutlet,
}

impl LslMarkerOutlet {
    pub fn new(config: &MarkerStreamConfig) -> Result<Self> {
        let info = lsl::StreamInfo::new(
            &config.name,
            &config.stream_type,
            1,
            0.0, // irregular rate
            lsl::ChannelFormat::Int32,
            &config.source_id,
        )?;
        let outlet = lsl::StreamOutlet::new(&info, 0, 360)?;
        tracing::info!(
            "Marker outlet '{}' ({}) is live",
            config.name,
            config.source_id
        );
        Ok(Self { outlet })
    }
}

impl MarkerOutlet for LslMarkerOutlet {
    fn push(&mut self, marker: i32) -> Result<()> {
        self.outlet.push_sample(&vec![marker])?;
        Ok(())
    }
}

/// Outlet that keeps every published id in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryOutlet {
    published: Arc<Mutex<Vec<i32>>>,
}

impl MemoryOutlet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the ids delivered so far, in publication order
    pub fn published(&self) -> Vec<i32> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MarkerOutlet for MemoryOutlet {
    fn push(&mut self, marker: i32) -> Result<()> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(marker);
        Ok(())
    }
}

/// Fire-and-forget publish point backed by a publisher thread
pub struct MarkerChannel {
    sender: Option<Sender<i32>>,
    worker: Option<JoinHandle<()>>,
}

impl MarkerChannel {
    /// Spawn the publisher thread; the outlet is built on that thread
    pub fn spawn<F, O>(make_outlet: F) -> Result<Self>
    where
        F: FnOnce() -> Result<O> + Send + 'static,
        O: MarkerOutlet,
    {
        let (sender, receiver) = mpsc::channel::<i32>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let worker = thread::Builder::new()
            .name("marker-publisher".to_string())
            .spawn(move || {
                let mut outlet = match make_outlet() {
                    Ok(outlet) => {
                        let _ = ready_tx.send(Ok(()));
                        outlet
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                for marker in receiver {
                    if let Err(e) = outlet.push(marker) {
                        tracing::warn!("Marker {} was not delivered: {}", marker, e);
                    }
                }
            })?;

        ready_rx
            .recv()
            .map_err(|_| anyhow::anyhow!("marker publisher exited during setup"))??;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Marker channel over an LSL outlet
    pub fn lsl(config: MarkerStreamConfig) -> Result<Self> {
        Self::spawn(move || LslMarkerOutlet::new(&config))
    }

    /// Marker channel over an in-memory outlet; returns a handle to read it back
    pub fn in_memory() -> Result<(Self, MemoryOutlet)> {
        let outlet = MemoryOutlet::new();
        let handle = outlet.clone();
        Ok((Self::spawn(move || Ok(outlet))?, handle))
    }

    /// Enqueue a marker id. Never blocks.
    pub fn publish(&self, marker: i32) {
        match &self.sender {
            Some(sender) => {
                if sender.send(marker).is_err() {
                    tracing::warn!("Marker publisher is gone; dropped marker {}", marker);
                }
            }
            None => tracing::warn!("Marker channel closed; dropped marker {}", marker),
        }
    }

    /// Deliver everything queued and stop the publisher thread
    pub fn close(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!("Marker publisher thread panicked");
        }
    }
}

impl Drop for MarkerChannel {
    fn drop(&mut self) {
        self.close();
    }
}
