//! EEG Trial Toolbox - acquisition and synchronization for word/color EEG sessions
//!
//! This crate records an OpenBCI Cyton board (or a synthetic stand-in) while a
//! trial sequencer presents colored words, publishes an integer marker per
//! stimulus over Lab Streaming Layer, and logs the wall-clock time of each
//! presentation. An offline tool then maps logged events onto the recorded
//! sample grid and cuts epochs.
//!
//! # Command-Line Tools
//!
//! - `eeg-run` - Full session: discovery, baseline, trials, memory test
//! - `eeg-scan` - Probe serial ports for a board and report what answered
//! - `eeg-align` - Align a finished run's stimulus log to its samples
//!
//! # Quick Start
//!
//! ```bash
//! # Record a participant (falls back to the synthetic board if none is found)
//! eeg-run --participant P001 --output results
//! # Commands while running: ABORT, QUIT, STATUS; memory test answers: y / n / escape
//!
//! # Cut epochs from -0.2 s to 0.8 s around every trial marker
//! eeg-align results/P001 --tmin -0.2 --tmax 0.8
//! ```
//!
//! # Run Directory
//!
//! ```text
//! results/P001/
//! ├── recording.zarr/
//! │   ├── baseline/{data,time}   [C × N] float64, [N] float64
//! │   ├── main/{data,time}
//! │   └── epochs/marker_<id>     (written by eeg-align)
//! ├── stimulus_log.csv           trial,word,color,timestamp,marker
//! └── memory_test_results.csv    word,color,response,accuracy
//! ```
//!
//! # Marker Ids
//!
//! Trials publish `1..=n_trials`; `999` and `1000` bracket the baseline
//! window, which is why at most 998 trials are allowed.
//!
//! # Library Usage
//!
//! - [`scanner`] - Serial port discovery
//! - [`device`] - Acquisition devices and the shared sample buffer
//! - [`session`] - Device session lifecycle
//! - [`markers`] - Marker channel
//! - [`sequencer`] - Trial state machine and presentation traits
//! - [`record`] - Zarr sample records and CSV logs
//! - [`align`] - Offline event-to-sample alignment
//!
//! # License
//!
//! This project is licensed under the GNU General Public License v3.0.
//! See the README for details.

pub mod align;
pub mod cli;
pub mod commands;
pub mod device;
pub mod error;
pub mod markers;
pub mod record;
pub mod scanner;
pub mod sequencer;
pub mod session;

use chrono::Datelike;

/// Display GPL license notice for a program
pub fn display_license_notice(program_name: &str) {
	let version = env!("CARGO_PKG_VERSION");
	let current_year = chrono::Utc::now().year();
	let copyright_year = if current_year == 2026 {
		"2026".to_string()
	} else {
		format!("2026-{}", current_year)
	};

	println!("{} {} Copyright (C) {} EEG Trial Toolbox contributors", program_name, version, copyright_year);
	println!("This program comes with ABSOLUTELY NO WARRANTY.");
	println!("For details see https://www.gnu.org/licenses/gpl-3.0.html#license-text.");
	println!("This is free software, and you are welcome to redistribute it under certain conditions.");
	println!();
}
