//! Stimulus log and memory-test results as CSV
//!
//! Header of the stimulus log: `trial,word,color,timestamp,marker`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

use crate::sequencer::memory::MemoryResult;
use crate::sequencer::palette;

/// One presented stimulus, written the moment its marker is published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusEvent {
    /// One-based trial number
    pub trial: usize,
    pub word: String,
    /// Palette label
    pub color: String,
    /// Host wall-clock unix seconds sampled right before publishing
    pub timestamp: f64,
    pub marker: i32,
}

/// Append-only CSV writer; each row is flushed as it is logged
pub struct StimulusLogWriter {
    writer: csv::Writer<File>,
    rows: usize,
}

impl StimulusLogWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let writer = csv::Writer::from_path(path)?;
        Ok(Self { writer, rows: 0 })
    }

    pub fn log(&mut self, event: &StimulusEvent) -> Result<()> {
        self.writer.serialize(event)?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }
}

/// Read a stimulus log, normalizing hex colors to palette labels
pub fn read_stimulus_log(path: &Path) -> Result<Vec<StimulusEvent>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut events = Vec::new();

    for (row, record) in reader.deserialize::<StimulusEvent>().enumerate() {
        let mut event =
            record.map_err(|e| anyhow::anyhow!("{}: row {}: {}", path.display(), row + 1, e))?;
        if let Some(label) = palette::normalize(&event.color) {
            event.color = label.to_string();
        }
        events.push(event);
    }

    Ok(events)
}

pub fn write_memory_results(path: &Path, results: &[MemoryResult]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for result in results {
        writer.serialize(result)?;
    }
    writer.flush()?;
    Ok(())
}
