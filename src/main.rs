//! EEG Run - one full word/color session for one participant
//!
//! Finds a board (or falls back to the synthetic device), records a
//! baseline window, presents the trials while publishing one marker per
//! stimulus, saves everything under `<output>/<participant>/`, then runs
//! the recognition memory test.
//!
//! # Usage
//!
//! ```bash
//! # Auto-discover the board
//! eeg-run --participant P001
//!
//! # Known port, shorter session
//! eeg-run -p P002 --port /dev/ttyUSB0 --trials 10 --baseline 10
//!
//! # Dry run without hardware or LSL
//! eeg-run -p test --synthetic --no-lsl --baseline 1 --instructions 0
//! ```
//!
//! # Interactive Commands
//!
//! - `ABORT` / `QUIT` - Stop the run; recorded data is still saved
//! - `STATUS` - Print whether the run is still going
//! - `y` / `n` / `escape` - Memory test answers
//!
//! Ctrl-C behaves like `ABORT`.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use eeg_trial_toolbox::cli::Args;
use eeg_trial_toolbox::commands::spawn_stdin_commands;
use eeg_trial_toolbox::markers::MarkerChannel;
use eeg_trial_toolbox::record::{RunDirectory, RunMetadata};
use eeg_trial_toolbox::scanner::discover;
use eeg_trial_toolbox::sequencer::surface::{HeadlessSurface, LineResponses};
use eeg_trial_toolbox::sequencer::{RunConfig, RunContext, RunReport, TrialSequencer};
use eeg_trial_toolbox::session::{DataSource, Session};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if !args.quiet {
        eeg_trial_toolbox::display_license_notice("eeg-run");
        tracing_subscriber::fmt::init();
    }

    let run_config = args.run_config();
    run_config.validate()?;

    let abort = Arc::new(AtomicBool::new(false));
    {
        let abort = abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("STATUS ABORTING (Ctrl-C)");
                abort.store(true, Ordering::SeqCst);
            }
        });
    }
    let lines = spawn_stdin_commands(abort.clone());

    let report =
        tokio::task::spawn_blocking(move || run_session(args, run_config, abort, lines)).await??;

    match report.aborted_in {
        None => println!("Experiment complete. Data saved."),
        Some(phase) => println!(
            "Run aborted during {:?} after {} trial(s); recorded data saved.",
            phase, report.trials_presented
        ),
    }
    Ok(())
}

fn open_session(args: &Args) -> Result<Session> {
    let scan_config = args.scan_config();

    let source = if args.synthetic {
        DataSource::Synthetic {
            channels: args.synthetic_channels,
        }
    } else if let Some(port) = &args.port {
        DataSource::Hardware(port.clone())
    } else {
        println!("Searching for an OpenBCI board...");
        let found = discover(&scan_config);
        match &found {
            Some(port) => println!("OpenBCI board found on {}", port),
            None => println!("No board found; using the synthetic device"),
        }
        DataSource::from_discovery(found, args.synthetic_channels)
    };

    // No data source means no experiment; nothing has been shown yet
    Session::open(source, &scan_config).context("Cannot open the acquisition device")
}

fn run_session(
    args: Args,
    run_config: RunConfig,
    abort: Arc<AtomicBool>,
    lines: Receiver<String>,
) -> Result<RunReport> {
    let session = open_session(&args)?;

    let markers = if args.no_lsl {
        let (channel, _published) = MarkerChannel::in_memory()?;
        channel
    } else {
        MarkerChannel::lsl(args.marker_config()).context("Cannot create the marker outlet")?
    };

    let metadata = RunMetadata {
        participant: args.participant.clone(),
        device: session.kind().name().to_string(),
        address: session.address().map(str::to_string),
        channel_count: session.channel_count(),
        sampling_rate: session.sampling_rate(),
        run_config: args.to_run_config_json(),
    };
    let mut run_dir = RunDirectory::create(&args.output, metadata)?;

    let mut surface = HeadlessSurface::new();
    let mut responses = LineResponses::new(lines, abort.clone());

    let outcome = TrialSequencer::new(
        run_config,
        RunContext {
            session,
            markers,
            surface: &mut surface,
            responses: &mut responses,
            sink: &mut run_dir,
            abort,
        },
    )
    .and_then(|sequencer| sequencer.run());

    // Flush whatever was recorded, even after a failure
    let saved = run_dir.finish();
    let report = outcome?;
    saved?;

    if !report.memory_results.is_empty() {
        println!(
            "Memory test: {} / {} correct",
            report.memory_score(),
            report.memory_results.len()
        );
    }
    Ok(report)
}
