use anyhow::Result;
use fs2::FileExt;
use ndarray::{Array1, Array2, Ix1, Ix2};
use serde_json::json;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use zarrs::array::Array;
use zarrs::filesystem::FilesystemStore;

use crate::device::SampleFrame;

/// Buffered writer for one sample record (`/<record>/data` and `/<record>/time`)
///
/// Frames are accumulated and appended to the arrays on [`flush`]. The
/// arrays grow along the samples axis; metadata is stored after every flush
/// so a crashed run still leaves a readable prefix.
///
/// [`flush`]: SampleRecordWriter::flush
pub struct SampleRecordWriter {
    store: Arc<FilesystemStore>,
    record_name: String,
    data_array: Array<FilesystemStore>,
    time_array: Array<FilesystemStore>,
    channel_count: usize,
    frame_buffer: Vec<SampleFrame>,
    buffer_size: usize,
    current_length: usize,
    first_timestamp: Option<f64>,
    last_timestamp: Option<f64>,
    last_flush_time: Instant,
    flush_interval: Duration,
    // Coordinates metadata writes with other writers of the same store
    metadata_lock: File,
}

impl SampleRecordWriter {
    pub fn new(
        store: Arc<FilesystemStore>,
        store_path: &Path,
        record_name: &str,
        data_array: Array<FilesystemStore>,
        time_array: Array<FilesystemStore>,
        buffer_size: usize,
        flush_interval: Duration,
    ) -> Result<Self> {
        let channel_count = data_array.shape()[0] as usize;
        let current_length = time_array.shape()[0] as usize;

        let lock_path = store_path.join(".zarr_metadata.lock");
        let metadata_lock = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;

        Ok(Self {
            store,
            record_name: record_name.to_string(),
            data_array,
            time_array,
            channel_count,
            frame_buffer: Vec::new(),
            buffer_size: buffer_size.max(1),
            current_length,
            first_timestamp: None,
            last_timestamp: None,
            last_flush_time: Instant::now(),
            flush_interval,
            metadata_lock,
        })
    }

    /// Queue drained frames; flushes when the buffer threshold is reached
    pub fn append(&mut self, frames: Vec<SampleFrame>) -> Result<()> {
        for frame in &frames {
            if frame.channels.len() != self.channel_count {
                anyhow::bail!(
                    "frame {} has {} channels, record '{}' expects {}",
                    frame.sequence,
                    frame.channels.len(),
                    self.record_name,
                    self.channel_count
                );
            }
        }
        self.frame_buffer.extend(frames);

        if self.needs_flush() {
            self.flush()?;
        }
        Ok(())
    }

    pub fn needs_flush(&self) -> bool {
        if self.frame_buffer.len() >= self.buffer_size {
            return true;
        }
        !self.frame_buffer.is_empty() && self.last_flush_time.elapsed() >= self.flush_interval
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.frame_buffer.is_empty() {
            return Ok(());
        }

        let num_samples = self.frame_buffer.len();
        let new_length = self.current_length + num_samples;

        // zarrs does not grow arrays on write
        self.data_array
            .set_shape(vec![self.channel_count as u64, new_length as u64])?;
        self.time_array.set_shape(vec![new_length as u64])?;

        let frames = std::mem::take(&mut self.frame_buffer);
        self.first_timestamp = self
            .first_timestamp
            .or_else(|| frames.first().map(|f| f.timestamp));
        self.last_timestamp = frames.last().map(|f| f.timestamp).or(self.last_timestamp);

        // Channel-first layout, matching the [channels, samples] array shape
        let mut flat = Vec::with_capacity(self.channel_count * num_samples);
        for channel in 0..self.channel_count {
            flat.extend(frames.iter().map(|f| f.channels[channel]));
        }
        let data = Array2::<f64>::from_shape_vec((self.channel_count, num_samples), flat)?;
        let times = Array1::from_vec(frames.iter().map(|f| f.timestamp).collect());

        self.data_array
            .store_array_subset_ndarray::<f64, Ix2>(&[0u64, self.current_length as u64], data)?;
        self.time_array
            .store_array_subset_ndarray::<f64, Ix1>(&[self.current_length as u64], times)?;

        self.current_length = new_length;
        self.last_flush_time = Instant::now();
        tracing::debug!(
            "Record '{}': wrote {} samples (total {})",
            self.record_name,
            num_samples,
            self.current_length
        );

        self.metadata_lock.lock_exclusive()?;
        let metadata_result = (|| -> Result<()> {
            self.data_array.store_metadata()?;
            self.time_array.store_metadata()?;
            Ok(())
        })();
        self.metadata_lock.unlock()?;
        metadata_result?;

        Ok(())
    }

    /// Flush the remainder and store summary attributes on the record group
    pub fn finalize(mut self, sampling_rate: f64) -> Result<usize> {
        self.flush()?;

        let group_path = format!("/{}", self.record_name);
        let mut group = zarrs::group::Group::open(self.store.clone(), &group_path)?;
        let mut attrs = serde_json::Map::new();
        attrs.insert("sample_count".to_string(), json!(self.current_length));
        attrs.insert("channel_count".to_string(), json!(self.channel_count));
        attrs.insert("sampling_rate".to_string(), json!(sampling_rate));
        attrs.insert("first_timestamp".to_string(), json!(self.first_timestamp));
        attrs.insert("last_timestamp".to_string(), json!(self.last_timestamp));
        attrs.insert(
            "finalized_at".to_string(),
            json!(chrono::Utc::now().to_rfc3339()),
        );

        self.metadata_lock.lock_exclusive()?;
        group.attributes_mut().extend(attrs);
        let stored = group.store_metadata();
        self.metadata_lock.unlock()?;
        stored?;

        tracing::info!(
            "Record '{}' finalized with {} samples",
            self.record_name,
            self.current_length
        );
        Ok(self.current_length)
    }

    /// Frames written so far plus frames still buffered
    pub fn sample_count(&self) -> usize {
        self.current_length + self.frame_buffer.len()
    }
}
