//! EEG Scan - probe serial ports for an OpenBCI board
//!
//! Runs the same identification handshake `eeg-run` uses and prints the
//! outcome for every port that was tried.
//!
//! # Usage
//!
//! ```bash
//! # Stop at the first board
//! eeg-scan
//!
//! # Probe every candidate and report all of them
//! eeg-scan --all
//!
//! # Probe specific ports only
//! eeg-scan --port /dev/ttyUSB0 --port /dev/ttyUSB1
//! ```

use anyhow::Result;
use clap::Parser;
use std::time::Duration;

use eeg_trial_toolbox::scanner::{
    candidate_addresses, open_serial, scan_candidates, CandidateState, Platform, ScanConfig,
};

#[derive(Parser)]
#[command(name = "eeg-scan")]
#[command(about = "Find an OpenBCI board on the serial ports")]
#[command(version)]
struct Args {
    /// Ports to probe instead of the platform's candidate list
    #[arg(long)]
    port: Vec<String>,

    /// Keep probing after the first board answers
    #[arg(long)]
    all: bool,

    /// Seconds to wait for the identification reply
    #[arg(long, default_value = "2.0")]
    timeout: f64,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if !args.quiet {
        eeg_trial_toolbox::display_license_notice("eeg-scan");
        tracing_subscriber::fmt::init();
    }

    let timeout = Duration::from_secs_f64(args.timeout.max(0.0));
    let config = ScanConfig {
        identification_timeout: timeout,
        settle: timeout,
        ..ScanConfig::default()
    };

    let platform = Platform::current();
    let addresses = if args.port.is_empty() {
        candidate_addresses(platform)?
    } else {
        args.port.clone()
    };

    if !args.json {
        println!("Probing {} port(s) on {:?}...", addresses.len(), platform);
    }
    let candidates = scan_candidates(&addresses, &config, !args.all, open_serial);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&candidates)?);
    } else {
        for candidate in candidates
            .iter()
            .filter(|c| !matches!(c.state, CandidateState::ProbeFailed | CandidateState::Unprobed))
        {
            println!("\t{:<24}{:?}", candidate.address, candidate.state);
        }
        let failed = candidates
            .iter()
            .filter(|c| c.state == CandidateState::ProbeFailed)
            .count();
        if failed > 0 {
            println!("\t({} port(s) could not be opened)", failed);
        }
    }

    let found = candidates
        .iter()
        .find(|c| c.state == CandidateState::Identified);
    if !args.json {
        match found {
            Some(found) => println!("OpenBCI board found on {}", found.address),
            None => println!("No board found; eeg-run would fall back to the synthetic device"),
        }
    }
    Ok(())
}
