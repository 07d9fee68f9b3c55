use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

use crate::markers::MarkerStreamConfig;
use crate::scanner::ScanConfig;
use crate::sequencer::{RunConfig, TrialTiming};

#[derive(Parser, Clone, Debug)]
#[command(name = "eeg-run")]
#[command(about = "Run a word/color EEG session: baseline, trials, memory test")]
pub struct Args {
    #[arg(long, short = 'p', help = "Participant identifier (names the run directory)")]
    pub participant: String,

    #[arg(
        long,
        short = 'o',
        help = "Directory that receives one sub-directory per participant",
        default_value = "results"
    )]
    pub output: PathBuf,

    #[arg(long, help = "Serial port of the board (skips discovery)")]
    pub port: Option<String>,

    #[arg(long, help = "Use the synthetic device even if a board is attached")]
    pub synthetic: bool,

    #[arg(
        long,
        default_value = "8",
        help = "Channel count of the synthetic device"
    )]
    pub synthetic_channels: usize,

    #[arg(long, default_value = "30", help = "Number of trials (must be below 999)")]
    pub trials: usize,

    #[arg(long, default_value = "30.0", help = "Baseline duration in seconds")]
    pub baseline: f64,

    #[arg(long, default_value = "5.0", help = "Instruction screen duration in seconds")]
    pub instructions: f64,

    #[arg(long, default_value = "0.3", help = "Fixation cross duration in seconds")]
    pub fixation: f64,

    #[arg(long, default_value = "0.5", help = "Word presentation duration in seconds")]
    pub word: f64,

    #[arg(long, default_value = "0.5", help = "Blank screen duration in seconds")]
    pub blank: f64,

    #[arg(long, default_value = "1.5", help = "Inter-trial interval in seconds")]
    pub iti: f64,

    #[arg(long, help = "Skip the recognition memory test")]
    pub no_memory_test: bool,

    #[arg(long, help = "Seed for word order and memory probes")]
    pub seed: Option<u64>,

    #[arg(long, default_value = "Markers", help = "Marker stream name")]
    pub marker_name: String,

    #[arg(long, default_value = "marker_stream", help = "Marker stream source ID")]
    pub marker_source_id: String,

    #[arg(long, help = "Publish markers in memory only (no LSL outlet)")]
    pub no_lsl: bool,

    #[arg(
        long,
        default_value = "2.0",
        help = "Seconds to wait for a board to answer the identification byte"
    )]
    pub identification_timeout: f64,

    #[arg(long, short = 'q', help = "Minimal output mode")]
    pub quiet: bool,
}

impl Args {
    pub fn timing(&self) -> TrialTiming {
        TrialTiming {
            baseline: Duration::from_secs_f64(self.baseline.max(0.0)),
            instructions: Duration::from_secs_f64(self.instructions.max(0.0)),
            fixation: Duration::from_secs_f64(self.fixation.max(0.0)),
            word: Duration::from_secs_f64(self.word.max(0.0)),
            blank: Duration::from_secs_f64(self.blank.max(0.0)),
            inter_trial: Duration::from_secs_f64(self.iti.max(0.0)),
            ..TrialTiming::default()
        }
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            n_trials: self.trials,
            timing: self.timing(),
            memory_test: !self.no_memory_test,
            seed: self.seed,
            ..RunConfig::default()
        }
    }

    pub fn scan_config(&self) -> ScanConfig {
        let timeout = Duration::from_secs_f64(self.identification_timeout.max(0.0));
        ScanConfig {
            identification_timeout: timeout,
            settle: timeout,
            ..ScanConfig::default()
        }
    }

    pub fn marker_config(&self) -> MarkerStreamConfig {
        MarkerStreamConfig {
            name: self.marker_name.clone(),
            source_id: self.marker_source_id.clone(),
            ..MarkerStreamConfig::default()
        }
    }

    /// Everything that shaped the run, stored with the recording
    pub fn to_run_config_json(&self) -> serde_json::Value {
        json!({
            "participant": self.participant,
            "output": self.output.display().to_string(),
            "port": self.port,
            "synthetic": self.synthetic,
            "synthetic_channels": self.synthetic_channels,
            "no_lsl": self.no_lsl,
            "marker_name": self.marker_name,
            "marker_source_id": self.marker_source_id,
            "identification_timeout": self.identification_timeout,
            "sequencer": self.run_config().to_json(),
            "toolbox_version": env!("CARGO_PKG_VERSION"),
        })
    }
}
