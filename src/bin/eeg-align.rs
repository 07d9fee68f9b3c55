//! EEG Align - place logged stimulus events on the recorded sample grid
//!
//! Reads `recording.zarr` and `stimulus_log.csv` from a run directory,
//! anchors every event on the first sample's device timestamp, and cuts a
//! fixed window around each onset.
//!
//! # Features
//!
//! - Per-epoch isolation: an event that falls outside the recording is
//!   reported and skipped, the others are still aligned
//! - Windows that run past the recording fail explicitly, never truncated
//! - Clock drift diagnostics (effective vs. nominal rate), reported only
//! - Accepted epochs written to `/epochs/marker_<id>` with a summary in the
//!   group attributes
//!
//! # Usage
//!
//! ```bash
//! eeg-align results/P001
//! eeg-align results/P001 --tmin -0.1 --tmax 0.6 --dry-run
//! eeg-align results/P001 --log results/P001/stimulus_log_cleaned.csv
//! ```
//!
//! Exits non-zero only when no event could be aligned.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use eeg_trial_toolbox::align::{align_table, extract_epochs, AlignmentReport, EpochWindow};
use eeg_trial_toolbox::record::stimulus_log::read_stimulus_log;
use eeg_trial_toolbox::record::{
    open_run_store, read_sample_table, write_epochs, MAIN_RECORD, STIMULUS_LOG_NAME, STORE_NAME,
};

#[derive(Parser)]
#[command(name = "eeg-align")]
#[command(about = "Align a run's stimulus log to its recorded samples")]
#[command(version)]
struct Args {
    /// Run directory (contains recording.zarr and stimulus_log.csv)
    run_dir: PathBuf,

    /// Window start relative to onset, in seconds
    #[arg(long, default_value = "-0.2", allow_hyphen_values = true)]
    tmin: f64,

    /// Window end relative to onset, in seconds; the sample at tmax is excluded
    #[arg(long, default_value = "0.8", allow_hyphen_values = true)]
    tmax: f64,

    /// Nominal sampling rate override (defaults to the recorded rate)
    #[arg(long)]
    rate: Option<f64>,

    /// Record to align against
    #[arg(long, default_value = MAIN_RECORD)]
    record: String,

    /// Stimulus log to use instead of the run's own
    #[arg(long)]
    log: Option<PathBuf>,

    /// Report only; do not write epochs into the store
    #[arg(long)]
    dry_run: bool,

    #[arg(short, long)]
    quiet: bool,
}

fn print_report(report: &AlignmentReport) {
    println!("\n=== Alignment Report ===");
    println!("\tAnchor (first sample):\t{:.6}", report.anchor);
    println!("\tNominal rate:\t\t{:.1} Hz", report.sampling_rate);
    match report.diagnostics.effective_rate {
        Some(rate) => println!("\tEffective rate:\t\t{:.3} Hz", rate),
        None => println!("\tEffective rate:\t\tn/a"),
    }
    println!("\tRecorded duration:\t{:.2} s", report.diagnostics.duration);
    println!(
        "\tWindow:\t\t\t[{:+.3} s, {:+.3} s)",
        report.window.tmin, report.window.tmax
    );

    println!("\nAccepted epochs: {}", report.epochs.len());
    for epoch in &report.epochs {
        println!(
            "\tmarker {:>4}\tonset {:>7}\tsamples {}..{}",
            epoch.marker, epoch.onset, epoch.start, epoch.end
        );
    }

    if !report.rejected.is_empty() {
        println!("\nRejected events: {}", report.rejected.len());
        for rejection in &report.rejected {
            println!("\ttrial {:>4}\t{}", rejection.trial, rejection.reason);
        }
    }

    if report.diagnostics.drift_suspected() {
        println!("\nWarning:");
        println!(
            "\t\t• Effective rate deviates {:.2}% from nominal; onsets assume a single clock offset",
            report.diagnostics.relative_deviation.unwrap_or_default() * 100.0
        );
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    if !args.quiet {
        eeg_trial_toolbox::display_license_notice("eeg-align");
        tracing_subscriber::fmt::init();
    }

    let store = open_run_store(&args.run_dir)?;
    let table = read_sample_table(&store, &args.record)?;
    let log_path = args
        .log
        .clone()
        .unwrap_or_else(|| args.run_dir.join(STIMULUS_LOG_NAME));
    let events = read_stimulus_log(&log_path)?;

    println!(
        "Loaded {} samples × {} channels from '{}' and {} events from {}",
        table.sample_count(),
        table.channel_count(),
        args.record,
        events.len(),
        log_path.display()
    );

    let window = EpochWindow {
        tmin: args.tmin,
        tmax: args.tmax,
    };
    let report = align_table(&table, &events, window, args.rate)?;
    print_report(&report);

    if report.epochs.is_empty() {
        anyhow::bail!("No event could be aligned to record '{}'", args.record);
    }

    if args.dry_run {
        println!("\nDry run: nothing written");
        return Ok(());
    }

    let epochs = extract_epochs(&table, &report);
    let store_path = args.run_dir.join(STORE_NAME);
    write_epochs(&store, &store_path, &epochs, report.to_json())?;
    println!(
        "\nWrote {} epoch(s) to {}/epochs",
        epochs.len(),
        store_path.display()
    );
    Ok(())
}
