//! Persistence of a run
//!
//! A run directory holds:
//!
//! ```text
//! <output>/<participant>/
//! ├── recording.zarr/
//! │   ├── baseline/
//! │   │   ├── data      [C × N] float64 (channels × samples)
//! │   │   └── time      [N] float64 (device timestamps, unix seconds)
//! │   ├── main/
//! │   │   ├── data
//! │   │   └── time
//! │   └── epochs/       (written by eeg-align)
//! │       └── marker_<id>  [C × W] float64
//! ├── stimulus_log.csv
//! └── memory_test_results.csv
//! ```
//!
//! Run-level metadata (run id, device, sampling rate, configuration) lives in
//! the root group attributes; per-record summaries in each record group.

pub mod stimulus_log;
pub mod writer;

use anyhow::Result;
use fs2::FileExt;
use ndarray::{Array2, Ix2};
use serde_json::json;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use zarrs::array::codec::{BloscCodec, BloscCompressionLevel, BloscCompressor, BloscShuffleMode};
use zarrs::array::{Array, ArrayBuilder, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStore;
use zarrs::group::GroupBuilder;
use zarrs::storage::{ReadableStorageTraits, StoreKey};

use crate::device::SampleFrame;
use crate::sequencer::memory::MemoryResult;
use stimulus_log::{write_memory_results, StimulusEvent, StimulusLogWriter};
use writer::SampleRecordWriter;

pub const STORE_NAME: &str = "recording.zarr";
pub const STIMULUS_LOG_NAME: &str = "stimulus_log.csv";
pub const MEMORY_RESULTS_NAME: &str = "memory_test_results.csv";
pub const BASELINE_RECORD: &str = "baseline";
pub const MAIN_RECORD: &str = "main";
pub const EPOCHS_GROUP: &str = "epochs";

const CHUNK_SAMPLES: u64 = 250;

/// Where the sequencer hands its outputs
pub trait RecordSink {
    fn baseline(&mut self, frames: Vec<SampleFrame>) -> Result<()>;

    fn main(&mut self, frames: Vec<SampleFrame>) -> Result<()>;

    fn stimulus(&mut self, event: &StimulusEvent) -> Result<()>;

    fn memory_results(&mut self, results: &[MemoryResult]) -> Result<()>;
}

/// Static facts about a run stored in the root group
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub participant: String,
    pub device: String,
    pub address: Option<String>,
    pub channel_count: usize,
    pub sampling_rate: f64,
    pub run_config: serde_json::Value,
}

/// Initialize or open a Zarr store with its root group
pub fn open_or_create_store(store_path: &Path) -> Result<Arc<FilesystemStore>> {
    std::fs::create_dir_all(store_path)?;
    let store = Arc::new(FilesystemStore::new(store_path)?);

    let lock_path = store_path.join(".zarr_init.lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)?;

    lock_file.lock_exclusive()?;
    let result = create_group_if_not_exists(&store, "/");
    lock_file.unlock()?;
    result?;

    Ok(store)
}

/// Check if a Zarr group exists (Zarr v3 uses zarr.json with node_type)
fn group_exists(store: &Arc<FilesystemStore>, path: &str) -> Result<bool> {
    let trimmed_path = path.trim_end_matches('/').trim_start_matches('/');
    let metadata_path = if trimmed_path.is_empty() {
        "zarr.json".to_string()
    } else {
        format!("{}/zarr.json", trimmed_path)
    };
    let metadata_key = StoreKey::new(&metadata_path)?;

    match store.get(&metadata_key) {
        Ok(Some(data)) => {
            let json: serde_json::Value = serde_json::from_slice(&data)?;
            Ok(json.get("node_type").and_then(|v| v.as_str()) == Some("group"))
        }
        _ => Ok(false),
    }
}

fn create_group_if_not_exists(store: &Arc<FilesystemStore>, path: &str) -> Result<()> {
    if !group_exists(store, path)? {
        let group = GroupBuilder::new().build(store.clone(), path)?;
        group.store_metadata()?;
    }
    Ok(())
}

/// Blosc/LZ4 with bit shuffling, suited to float64 signals and timestamps
fn float64_codec() -> Result<Arc<BloscCodec>> {
    let compression_level = BloscCompressionLevel::try_from(5u8)
        .map_err(|e| anyhow::anyhow!("Invalid compression level: {}", e))?;
    Ok(Arc::new(BloscCodec::new(
        BloscCompressor::LZ4,
        compression_level,
        None,
        BloscShuffleMode::BitShuffle,
        Some(8),
    )?))
}

/// Create the `data` and `time` arrays of one record
pub fn setup_record_arrays(
    store: &Arc<FilesystemStore>,
    record_name: &str,
    channel_count: usize,
) -> Result<(Array<FilesystemStore>, Array<FilesystemStore>)> {
    let record_path = format!("/{}", record_name);
    create_group_if_not_exists(store, &record_path)?;

    let data_path = format!("{}/data", record_path);
    let data_array = ArrayBuilder::new(
        vec![channel_count as u64, 0],
        vec![channel_count as u64, CHUNK_SAMPLES],
        DataType::Float64,
        FillValue::from(0.0f64),
    )
    .dimension_names(Some(vec![
        Some("channels".to_string()),
        Some("samples".to_string()),
    ]))
    .bytes_to_bytes_codecs(vec![float64_codec()?])
    .build(store.clone(), &data_path)?;
    data_array.store_metadata()?;

    let time_path = format!("{}/time", record_path);
    let time_array = ArrayBuilder::new(
        vec![0],
        vec![CHUNK_SAMPLES],
        DataType::Float64,
        FillValue::from(0.0f64),
    )
    .dimension_names(Some(vec![Some("samples".to_string())]))
    .bytes_to_bytes_codecs(vec![float64_codec()?])
    .build(store.clone(), &time_path)?;
    time_array.store_metadata()?;

    Ok((data_array, time_array))
}

/// Persisted outputs of one participant's run
pub struct RunDirectory {
    root: PathBuf,
    store_path: PathBuf,
    store: Arc<FilesystemStore>,
    metadata: RunMetadata,
    baseline: Option<SampleRecordWriter>,
    main: Option<SampleRecordWriter>,
    stimulus_log: StimulusLogWriter,
}

impl RunDirectory {
    /// Create `<output>/<participant>/` and the run's store and log files
    pub fn create(output: &Path, metadata: RunMetadata) -> Result<Self> {
        let root = output.join(&metadata.participant);
        std::fs::create_dir_all(&root)?;

        let store_path = root.join(STORE_NAME);
        let store = open_or_create_store(&store_path)?;

        let mut root_group = zarrs::group::Group::open(store.clone(), "/")?;
        let mut attrs = serde_json::Map::new();
        attrs.insert("run_id".to_string(), json!(uuid::Uuid::new_v4().to_string()));
        attrs.insert("participant".to_string(), json!(metadata.participant));
        attrs.insert("device".to_string(), json!(metadata.device));
        attrs.insert("address".to_string(), json!(metadata.address));
        attrs.insert("channel_count".to_string(), json!(metadata.channel_count));
        attrs.insert("sampling_rate".to_string(), json!(metadata.sampling_rate));
        attrs.insert("recorded_at".to_string(), json!(chrono::Utc::now().to_rfc3339()));
        attrs.insert(
            "hostname".to_string(),
            json!(hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_default()),
        );
        attrs.insert("run_config".to_string(), metadata.run_config.clone());
        attrs.insert("toolbox_version".to_string(), json!(env!("CARGO_PKG_VERSION")));
        root_group.attributes_mut().extend(attrs);
        root_group.store_metadata()?;

        let stimulus_log = StimulusLogWriter::create(&root.join(STIMULUS_LOG_NAME))?;
        tracing::info!("Run directory: {}", root.display());

        Ok(Self {
            root,
            store_path,
            store,
            metadata,
            baseline: None,
            main: None,
            stimulus_log,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_writer(&self, record_name: &str) -> Result<SampleRecordWriter> {
        let (data_array, time_array) =
            setup_record_arrays(&self.store, record_name, self.metadata.channel_count)?;
        let buffer_size = (self.metadata.sampling_rate as usize).clamp(10, 2000);
        SampleRecordWriter::new(
            self.store.clone(),
            &self.store_path,
            record_name,
            data_array,
            time_array,
            buffer_size,
            Duration::from_secs(1),
        )
    }

    fn append_record(&mut self, record_name: &str, frames: Vec<SampleFrame>) -> Result<()> {
        let slot_empty = match record_name {
            BASELINE_RECORD => self.baseline.is_none(),
            _ => self.main.is_none(),
        };
        if slot_empty {
            let writer = self.record_writer(record_name)?;
            match record_name {
                BASELINE_RECORD => self.baseline = Some(writer),
                _ => self.main = Some(writer),
            }
        }

        let slot = match record_name {
            BASELINE_RECORD => &mut self.baseline,
            _ => &mut self.main,
        };
        if let Some(writer) = slot.as_mut() {
            writer.append(frames)?;
        }
        Ok(())
    }

    /// Flush both records and write their summaries
    pub fn finish(mut self) -> Result<PathBuf> {
        let rate = self.metadata.sampling_rate;
        if let Some(writer) = self.baseline.take() {
            writer.finalize(rate)?;
        }
        if let Some(writer) = self.main.take() {
            writer.finalize(rate)?;
        }
        println!(
            "Saved {} stimulus rows and samples to {}",
            self.stimulus_log.rows(),
            self.root.display()
        );
        Ok(self.root)
    }
}

impl RecordSink for RunDirectory {
    fn baseline(&mut self, frames: Vec<SampleFrame>) -> Result<()> {
        self.append_record(BASELINE_RECORD, frames)
    }

    fn main(&mut self, frames: Vec<SampleFrame>) -> Result<()> {
        self.append_record(MAIN_RECORD, frames)
    }

    fn stimulus(&mut self, event: &StimulusEvent) -> Result<()> {
        self.stimulus_log.log(event)
    }

    fn memory_results(&mut self, results: &[MemoryResult]) -> Result<()> {
        write_memory_results(&self.root.join(MEMORY_RESULTS_NAME), results)
    }
}

/// A sample record loaded back for offline alignment
#[derive(Debug, Clone)]
pub struct SampleTable {
    /// Device timestamps, one per sample
    pub timestamps: Vec<f64>,
    /// Readings laid out as [channels, samples]
    pub data: Array2<f64>,
    pub sampling_rate: f64,
}

impl SampleTable {
    pub fn sample_count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn channel_count(&self) -> usize {
        self.data.nrows()
    }
}

/// Read attributes from a group's zarr.json file
pub fn read_group_attributes(store: &Arc<FilesystemStore>, path: &str) -> Result<serde_json::Value> {
    let trimmed_path = path.trim_end_matches('/').trim_start_matches('/');
    let zarr_json_path = if trimmed_path.is_empty() {
        "zarr.json".to_string()
    } else {
        format!("{}/zarr.json", trimmed_path)
    };
    let zarr_key = StoreKey::new(&zarr_json_path)?;
    let zarr_bytes = store
        .get(&zarr_key)?
        .ok_or_else(|| anyhow::anyhow!("Metadata not found at {}", zarr_json_path))?;
    let zarr_metadata: serde_json::Value = serde_json::from_slice(&zarr_bytes)?;

    Ok(zarr_metadata
        .get("attributes")
        .cloned()
        .unwrap_or_else(|| json!({})))
}

/// Load one record of a run's store
pub fn read_sample_table(store: &Arc<FilesystemStore>, record_name: &str) -> Result<SampleTable> {
    let record_path = format!("/{}", record_name);

    let time_array = Array::<FilesystemStore>::open(store.clone(), &format!("{}/time", record_path))?;
    let data_array = Array::<FilesystemStore>::open(store.clone(), &format!("{}/data", record_path))?;

    let sample_count = time_array.shape()[0];
    let channel_count = data_array.shape()[0];
    if data_array.shape()[1] != sample_count {
        anyhow::bail!(
            "record '{}' is inconsistent: {} timestamps but {} data columns",
            record_name,
            sample_count,
            data_array.shape()[1]
        );
    }

    let timestamps: Vec<f64> = if sample_count == 0 {
        Vec::new()
    } else {
        let subset = ArraySubset::new_with_start_shape(vec![0], vec![sample_count])?;
        time_array
            .retrieve_array_subset_ndarray::<f64>(&subset)?
            .iter()
            .copied()
            .collect()
    };

    let data = if sample_count == 0 {
        Array2::<f64>::zeros((channel_count as usize, 0))
    } else {
        let subset =
            ArraySubset::new_with_start_shape(vec![0, 0], vec![channel_count, sample_count])?;
        data_array
            .retrieve_array_subset_ndarray::<f64>(&subset)?
            .into_dimensionality::<Ix2>()?
    };

    let record_attrs = read_group_attributes(store, &record_path)?;
    let root_attrs = read_group_attributes(store, "/")?;
    let sampling_rate = record_attrs
        .get("sampling_rate")
        .and_then(|v| v.as_f64())
        .or_else(|| root_attrs.get("sampling_rate").and_then(|v| v.as_f64()))
        .unwrap_or(0.0);

    Ok(SampleTable {
        timestamps,
        data,
        sampling_rate,
    })
}

/// Open an existing run store read-write
pub fn open_run_store(run_dir: &Path) -> Result<Arc<FilesystemStore>> {
    let store_path = run_dir.join(STORE_NAME);
    if !store_path.exists() {
        anyhow::bail!("No recording store at {}", store_path.display());
    }
    Ok(Arc::new(FilesystemStore::new(&store_path)?))
}

/// Replace `/epochs` with one array per accepted epoch plus a summary
pub fn write_epochs(
    store: &Arc<FilesystemStore>,
    store_path: &Path,
    epochs: &[(i32, Array2<f64>)],
    summary: serde_json::Value,
) -> Result<()> {
    let epochs_dir = store_path.join(EPOCHS_GROUP);
    if epochs_dir.exists() {
        std::fs::remove_dir_all(&epochs_dir)?;
    }

    let group_path = format!("/{}", EPOCHS_GROUP);
    create_group_if_not_exists(store, &group_path)?;

    for (marker, window) in epochs {
        let (channels, samples) = window.dim();
        let array = ArrayBuilder::new(
            vec![channels as u64, samples as u64],
            vec![channels as u64, (samples as u64).max(1)],
            DataType::Float64,
            FillValue::from(0.0f64),
        )
        .dimension_names(Some(vec![
            Some("channels".to_string()),
            Some("samples".to_string()),
        ]))
        .bytes_to_bytes_codecs(vec![float64_codec()?])
        .build(store.clone(), &format!("{}/marker_{}", group_path, marker))?;
        array.store_metadata()?;
        if samples > 0 {
            array.store_array_subset_ndarray::<f64, Ix2>(&[0, 0], window.clone())?;
        }
    }

    let mut group = zarrs::group::Group::open(store.clone(), &group_path)?;
    if let serde_json::Value::Object(map) = summary {
        group.attributes_mut().extend(map);
    }
    group.store_metadata()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(start: u64, count: u64, channels: usize) -> Vec<SampleFrame> {
        (start..start + count)
            .map(|i| SampleFrame {
                sequence: i,
                timestamp: 1_700_000_000.0 + i as f64 / 250.0,
                channels: (0..channels).map(|c| (i * 10 + c as u64) as f64).collect(),
            })
            .collect()
    }

    fn metadata() -> RunMetadata {
        RunMetadata {
            participant: "P001".to_string(),
            device: "synthetic".to_string(),
            address: None,
            channel_count: 3,
            sampling_rate: 250.0,
            run_config: json!({"n_trials": 2}),
        }
    }

    #[test]
    fn records_round_trip_through_the_store() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut run = RunDirectory::create(dir.path(), metadata())?;

        run.baseline(frames(0, 40, 3))?;
        run.main(frames(40, 300, 3))?;
        run.main(frames(340, 7, 3))?;
        let root = run.finish()?;

        let store = open_run_store(&root)?;
        let baseline = read_sample_table(&store, BASELINE_RECORD)?;
        let main = read_sample_table(&store, MAIN_RECORD)?;

        assert_eq!(baseline.sample_count(), 40);
        assert_eq!(main.sample_count(), 307);
        assert_eq!(main.channel_count(), 3);
        assert_eq!(main.sampling_rate, 250.0);
        assert_eq!(main.timestamps[0], 1_700_000_000.0 + 40.0 / 250.0);
        assert_eq!(main.data[[2, 306]], (346 * 10 + 2) as f64);

        let attrs = read_group_attributes(&store, "/")?;
        assert_eq!(attrs.get("participant").and_then(|v| v.as_str()), Some("P001"));
        Ok(())
    }

    #[test]
    fn mismatched_channel_count_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut run = RunDirectory::create(dir.path(), metadata())?;
        assert!(run.main(frames(0, 5, 2)).is_err());
        Ok(())
    }
}
