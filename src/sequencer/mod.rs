//! Trial sequencer
//!
//! Drives one run through
//!
//! ```text
//! Idle -> BaselineCapture -> Instructions -> TrialLoop(0..n) -> MemoryTest -> Done
//! ```
//!
//! Everything a run touches (session, marker channel, presentation
//! collaborators, persistence, abort flag) is handed in through a
//! [`RunContext`]. Waits are monotonic deadlines checked with short sleeps,
//! so an abort is noticed within a few milliseconds at any point; every exit
//! path ends in [`Session::release`].

pub mod memory;
pub mod palette;
pub mod surface;

use anyhow::Result;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::device::wall_clock_now;
use crate::markers::{trial_marker, MarkerChannel, BASELINE_END, BASELINE_START, MAX_TRIALS};
use crate::record::stimulus_log::StimulusEvent;
use crate::record::RecordSink;
use crate::session::Session;
use memory::{MemoryResult, PresentedWord};
use palette::color_for_trial;
use surface::{Response, ResponseSource, StimulusSurface};

/// The word pool presented during the trial loop
pub const WORDS: [&str; 30] = [
    "apple", "banana", "carrot", "dog", "elephant", "fish", "grape", "house", "ice", "jacket",
    "kite", "lemon", "mango", "nest", "orange", "pear", "queen", "rabbit", "snake", "tiger",
    "umbrella", "violin", "whale", "xylophone", "yacht", "zebra", "sink", "cap", "drawer",
    "tissue",
];

pub const INSTRUCTIONS: &str =
    "You will see words in different colors. Focus on both the word and the color.";

pub const MEMORY_INSTRUCTIONS: &str = "Now, you will be asked if you saw certain words in \
     specific colors. Respond with 'Y' for Yes or 'N' for No.";

const WAIT_STEP: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq)]
pub struct TrialTiming {
    pub baseline: Duration,
    pub instructions: Duration,
    pub fixation: Duration,
    pub word: Duration,
    pub blank: Duration,
    pub inter_trial: Duration,
    pub memory_instructions: Duration,
    pub results: Duration,
}

impl Default for TrialTiming {
    fn default() -> Self {
        Self {
            baseline: Duration::from_secs(30),
            instructions: Duration::from_secs(5),
            fixation: Duration::from_millis(300),
            word: Duration::from_millis(500),
            blank: Duration::from_millis(500),
            inter_trial: Duration::from_millis(1500),
            memory_instructions: Duration::from_secs(5),
            results: Duration::from_secs(5),
        }
    }
}

impl TrialTiming {
    /// Every interval zero; used by tests and dry runs
    pub fn immediate() -> Self {
        Self {
            baseline: Duration::ZERO,
            instructions: Duration::ZERO,
            fixation: Duration::ZERO,
            word: Duration::ZERO,
            blank: Duration::ZERO,
            inter_trial: Duration::ZERO,
            memory_instructions: Duration::ZERO,
            results: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub n_trials: usize,
    pub words: Vec<String>,
    pub timing: TrialTiming,
    pub memory_test: bool,
    /// Seed for word shuffling and probe generation; random when `None`
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            n_trials: 30,
            words: WORDS.iter().map(|w| w.to_string()).collect(),
            timing: TrialTiming::default(),
            memory_test: true,
            seed: None,
        }
    }
}

impl RunConfig {
    /// Reject configurations whose markers could collide or that run out of words
    pub fn validate(&self) -> Result<()> {
        if self.n_trials == 0 {
            anyhow::bail!("n_trials must be at least 1");
        }
        if self.n_trials > MAX_TRIALS {
            anyhow::bail!(
                "n_trials must be below {} so trial markers never reach the baseline sentinels (got {})",
                BASELINE_START,
                self.n_trials
            );
        }
        let unique: HashSet<&str> = self.words.iter().map(|w| w.as_str()).collect();
        if unique.len() != self.words.len() {
            anyhow::bail!("word list contains duplicates");
        }
        if self.words.len() < self.n_trials {
            anyhow::bail!(
                "{} trials requested but only {} words available",
                self.n_trials,
                self.words.len()
            );
        }
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Value {
        let t = &self.timing;
        json!({
            "n_trials": self.n_trials,
            "words": self.words,
            "memory_test": self.memory_test,
            "seed": self.seed,
            "timing": {
                "baseline": t.baseline.as_secs_f64(),
                "instructions": t.instructions.as_secs_f64(),
                "fixation": t.fixation.as_secs_f64(),
                "word": t.word.as_secs_f64(),
                "blank": t.blank.as_secs_f64(),
                "inter_trial": t.inter_trial.as_secs_f64(),
                "memory_instructions": t.memory_instructions.as_secs_f64(),
                "results": t.results.as_secs_f64(),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    BaselineCapture,
    Instructions,
    TrialLoop,
    MemoryTest,
    Done,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// `None` when the run completed, otherwise the phase that was interrupted
    pub aborted_in: Option<RunPhase>,
    pub trials_presented: usize,
    pub baseline_samples: usize,
    pub main_samples: usize,
    pub memory_results: Vec<MemoryResult>,
}

impl RunReport {
    pub fn completed(&self) -> bool {
        self.aborted_in.is_none()
    }

    pub fn memory_score(&self) -> usize {
        self.memory_results.iter().filter(|r| r.is_correct()).count()
    }
}

/// Everything one run needs, passed in explicitly
pub struct RunContext<'a> {
    pub session: Session,
    pub markers: MarkerChannel,
    pub surface: &'a mut dyn StimulusSurface,
    pub responses: &'a mut dyn ResponseSource,
    pub sink: &'a mut dyn RecordSink,
    pub abort: Arc<AtomicBool>,
}

/// Sleep until `deadline`; returns `false` as soon as `abort` is raised
pub fn wait_until(deadline: Instant, abort: &AtomicBool) -> bool {
    loop {
        if abort.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(WAIT_STEP));
    }
}

pub fn wait_for(duration: Duration, abort: &AtomicBool) -> bool {
    wait_until(Instant::now() + duration, abort)
}

pub struct TrialSequencer<'a> {
    config: RunConfig,
    ctx: RunContext<'a>,
    rng: fastrand::Rng,
    phase: RunPhase,
    presented: Vec<PresentedWord>,
    report: RunReport,
}

impl<'a> TrialSequencer<'a> {
    pub fn new(config: RunConfig, ctx: RunContext<'a>) -> Result<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Ok(Self {
            config,
            ctx,
            rng,
            phase: RunPhase::Idle,
            presented: Vec::new(),
            report: RunReport {
                aborted_in: None,
                trials_presented: 0,
                baseline_samples: 0,
                main_samples: 0,
                memory_results: Vec::new(),
            },
        })
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn enter(&mut self, phase: RunPhase) {
        tracing::info!("Run phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    fn wait(&self, duration: Duration) -> bool {
        wait_for(duration, &self.ctx.abort)
    }

    fn aborted(&self) -> bool {
        self.ctx.abort.load(Ordering::SeqCst)
    }

    /// Run every phase; the session is released before this returns
    pub fn run(mut self) -> Result<RunReport> {
        let result = self.run_phases();

        // Acquisition resources go first, whatever happened above
        self.ctx.session.release();
        self.ctx.markers.close();

        if let Err(e) = result {
            tracing::error!("Run failed during {:?}: {}", self.phase, e);
            return Err(e);
        }

        if self.report.aborted_in.is_none() && self.config.memory_test {
            self.memory_test()?;
        }

        if self.report.aborted_in.is_none() {
            self.enter(RunPhase::Done);
        }
        Ok(self.report)
    }

    fn interrupted(&mut self) -> Result<()> {
        tracing::warn!("Run aborted during {:?}", self.phase);
        self.report.aborted_in = Some(self.phase);
        Ok(())
    }

    fn run_phases(&mut self) -> Result<()> {
        if self.aborted() {
            return self.interrupted();
        }

        self.enter(RunPhase::BaselineCapture);
        if !self.baseline()? {
            return self.interrupted();
        }

        self.enter(RunPhase::Instructions);
        self.ctx.surface.message(INSTRUCTIONS);
        if !self.wait(self.config.timing.instructions) {
            return self.interrupted();
        }

        self.enter(RunPhase::TrialLoop);
        let completed = self.trial_loop()?;
        self.save_main()?;
        if !completed {
            return self.interrupted();
        }
        Ok(())
    }

    /// Returns `false` when aborted during the hold
    fn baseline(&mut self) -> Result<bool> {
        println!(
            "Starting {:.0}-second baseline EEG data collection...",
            self.config.timing.baseline.as_secs_f64()
        );
        self.ctx.session.start_stream()?;
        self.ctx.markers.publish(BASELINE_START);

        let held = self.wait(self.config.timing.baseline);
        if held {
            self.ctx.markers.publish(BASELINE_END);
        }

        // Stopping first keeps late baseline frames out of the main record
        self.ctx.session.stop_stream()?;
        let frames = self.ctx.session.read_buffered()?;
        self.report.baseline_samples = frames.len();
        self.ctx.sink.baseline(frames)?;

        if held {
            println!(
                "Baseline EEG data collection complete ({} samples). Starting the main experiment...",
                self.report.baseline_samples
            );
        }
        Ok(held)
    }

    /// Returns `false` when aborted before the last trial finished
    fn trial_loop(&mut self) -> Result<bool> {
        let leftover = self.ctx.session.read_buffered()?;
        if !leftover.is_empty() {
            tracing::warn!(
                "{} frames arrived after the baseline drain; appending them to the baseline",
                leftover.len()
            );
            self.report.baseline_samples += leftover.len();
            self.ctx.sink.baseline(leftover)?;
        }

        let mut words = self.config.words.clone();
        self.rng.shuffle(&mut words);

        self.ctx.session.start_stream()?;
        let timing = self.config.timing.clone();

        for (trial, word) in words.into_iter().take(self.config.n_trials).enumerate() {
            let color = color_for_trial(trial);

            self.ctx.surface.fixation();
            if !self.wait(timing.fixation) {
                return Ok(false);
            }

            self.ctx.surface.word(&word, color);
            // Sampled once, right before the marker goes out
            let timestamp = wall_clock_now();
            let marker = trial_marker(trial);
            self.ctx.markers.publish(marker);

            let event = StimulusEvent {
                trial: trial + 1,
                word: word.clone(),
                color: color.label.to_string(),
                timestamp,
                marker,
            };
            self.ctx.sink.stimulus(&event)?;
            self.presented.push(PresentedWord { word, color });
            self.report.trials_presented += 1;
            tracing::debug!("Trial {} marker {} at {:.6}", event.trial, marker, timestamp);

            if !self.wait(timing.word) {
                return Ok(false);
            }

            self.ctx.surface.blank();
            if !self.wait(timing.blank) {
                return Ok(false);
            }

            self.ctx.surface.fixation();
            if !self.wait(timing.inter_trial) {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn save_main(&mut self) -> Result<()> {
        self.ctx.session.stop_stream()?;
        let frames = self.ctx.session.read_buffered()?;
        self.report.main_samples = frames.len();
        self.ctx.sink.main(frames)?;
        tracing::info!("Main record holds {} samples", self.report.main_samples);
        Ok(())
    }

    fn memory_test(&mut self) -> Result<()> {
        self.enter(RunPhase::MemoryTest);
        self.ctx.surface.message(MEMORY_INSTRUCTIONS);
        if !self.wait(self.config.timing.memory_instructions) {
            return self.interrupted();
        }

        let probes = memory::generate_probes(&self.presented, &mut self.rng);
        let mut results = Vec::with_capacity(probes.len());
        let mut escaped = false;

        for probe in &probes {
            if self.aborted() {
                escaped = true;
                break;
            }
            self.ctx.surface.word(&probe.word, probe.color);
            self.ctx.surface.message(&format!(
                "Did you see the word '{}' with a {} background? (Y/N)",
                probe.word, probe.color.label
            ));

            let response = self.ctx.responses.wait_response();
            if response == Response::Escape {
                self.ctx.abort.store(true, Ordering::SeqCst);
                escaped = true;
                break;
            }
            results.push(memory::score(probe, response, &self.presented));
        }

        self.ctx.sink.memory_results(&results)?;
        self.report.memory_results = results;

        if escaped {
            return self.interrupted();
        }

        self.ctx.surface.message(&format!(
            "Memory test complete. You got {} out of {} correct.",
            self.report.memory_score(),
            probes.len()
        ));
        self.wait(self.config.timing.results);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::synthetic::SyntheticDevice;
    use crate::device::SampleFrame;
    use crate::error::SessionError;
    use crate::session::SessionState;
    use memory::FOIL_WORDS;
    use surface::{HeadlessSurface, ScriptedResponses};

    #[derive(Default)]
    struct CollectingSink {
        baseline: Vec<SampleFrame>,
        main: Vec<SampleFrame>,
        events: Vec<StimulusEvent>,
        memory: Vec<MemoryResult>,
    }

    impl RecordSink for CollectingSink {
        fn baseline(&mut self, frames: Vec<SampleFrame>) -> Result<()> {
            self.baseline.extend(frames);
            Ok(())
        }

        fn main(&mut self, frames: Vec<SampleFrame>) -> Result<()> {
            self.main.extend(frames);
            Ok(())
        }

        fn stimulus(&mut self, event: &StimulusEvent) -> Result<()> {
            self.events.push(event.clone());
            Ok(())
        }

        fn memory_results(&mut self, results: &[MemoryResult]) -> Result<()> {
            self.memory = results.to_vec();
            Ok(())
        }
    }

    fn quick_config(n_trials: usize) -> RunConfig {
        RunConfig {
            n_trials,
            timing: TrialTiming::immediate(),
            seed: Some(42),
            ..RunConfig::default()
        }
    }

    fn synthetic_session() -> Session {
        Session::open_device(Box::new(SyntheticDevice::new(4))).unwrap()
    }

    #[test]
    fn thirty_trials_alternate_colors_and_number_markers() {
        let (markers, outlet) = MarkerChannel::in_memory().unwrap();
        let mut surface = HeadlessSurface::new();
        let mut responses = ScriptedResponses::constant(Response::Yes);
        let mut sink = CollectingSink::default();

        let ctx = RunContext {
            session: synthetic_session(),
            markers,
            surface: &mut surface,
            responses: &mut responses,
            sink: &mut sink,
            abort: Arc::new(AtomicBool::new(false)),
        };
        let report = TrialSequencer::new(quick_config(30), ctx).unwrap().run().unwrap();

        assert!(report.completed());
        assert_eq!(report.trials_presented, 30);
        assert_eq!(sink.events.len(), 30);
        for (i, event) in sink.events.iter().enumerate() {
            assert_eq!(event.trial, i + 1);
            assert_eq!(event.marker, (i + 1) as i32);
            assert_eq!(event.color, color_for_trial(i).label);
        }
        assert!(sink.events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let published = outlet.published();
        assert_eq!(published.first(), Some(&BASELINE_START));
        assert_eq!(published.get(1), Some(&BASELINE_END));
        assert_eq!(&published[2..], (1..=30).collect::<Vec<i32>>().as_slice());

        assert_eq!(sink.memory.len(), memory::SAMPLED_PROBES + FOIL_WORDS.len());
    }

    #[test]
    fn emitted_markers_are_unique() {
        for n_trials in [1, 2, 7, 30] {
            let (markers, outlet) = MarkerChannel::in_memory().unwrap();
            let mut surface = HeadlessSurface::new();
            let mut responses = ScriptedResponses::constant(Response::No);
            let mut sink = CollectingSink::default();
            let ctx = RunContext {
                session: synthetic_session(),
                markers,
                surface: &mut surface,
                responses: &mut responses,
                sink: &mut sink,
                abort: Arc::new(AtomicBool::new(false)),
            };
            TrialSequencer::new(quick_config(n_trials), ctx)
                .unwrap()
                .run()
                .unwrap();

            let published = outlet.published();
            let unique: HashSet<i32> = published.iter().copied().collect();
            assert_eq!(unique.len(), published.len());
            assert_eq!(published.len(), n_trials + 2);
        }
    }

    #[test]
    fn baseline_and_main_records_receive_samples() {
        let (markers, _outlet) = MarkerChannel::in_memory().unwrap();
        let mut surface = HeadlessSurface::new();
        let mut responses = ScriptedResponses::constant(Response::Yes);
        let mut sink = CollectingSink::default();

        let mut config = quick_config(3);
        config.timing.baseline = Duration::from_millis(200);
        config.timing.inter_trial = Duration::from_millis(100);
        config.memory_test = false;

        let ctx = RunContext {
            session: synthetic_session(),
            markers,
            surface: &mut surface,
            responses: &mut responses,
            sink: &mut sink,
            abort: Arc::new(AtomicBool::new(false)),
        };
        let report = TrialSequencer::new(config, ctx).unwrap().run().unwrap();

        assert!(!sink.baseline.is_empty());
        assert!(!sink.main.is_empty());
        assert_eq!(report.main_samples, sink.main.len());
        let last_baseline = sink.baseline.last().unwrap().sequence;
        assert!(sink.main.iter().all(|f| f.sequence > last_baseline));
        assert!(sink.memory.is_empty());
    }

    #[test]
    fn abort_mid_run_still_releases_the_session() {
        let (markers, outlet) = MarkerChannel::in_memory().unwrap();
        let mut surface = HeadlessSurface::new();
        let mut responses = ScriptedResponses::constant(Response::Yes);
        let mut sink = CollectingSink::default();
        let abort = Arc::new(AtomicBool::new(false));

        let mut config = quick_config(30);
        config.timing.inter_trial = Duration::from_millis(20);

        let trigger = abort.clone();
        let aborter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.store(true, Ordering::SeqCst);
        });

        let ctx = RunContext {
            session: synthetic_session(),
            markers,
            surface: &mut surface,
            responses: &mut responses,
            sink: &mut sink,
            abort,
        };
        let report = TrialSequencer::new(config, ctx).unwrap().run().unwrap();
        aborter.join().unwrap();

        assert_eq!(report.aborted_in, Some(RunPhase::TrialLoop));
        assert!(report.trials_presented < 30);
        assert_eq!(sink.events.len(), report.trials_presented);
        assert!(sink.memory.is_empty());
        assert!(outlet.published().len() < 32);
    }

    #[test]
    fn escape_during_memory_test_aborts() {
        let (markers, _outlet) = MarkerChannel::in_memory().unwrap();
        let mut surface = HeadlessSurface::new();
        let mut responses =
            ScriptedResponses::new([Response::Yes, Response::No], Response::Escape);
        let mut sink = CollectingSink::default();
        let abort = Arc::new(AtomicBool::new(false));

        let ctx = RunContext {
            session: synthetic_session(),
            markers,
            surface: &mut surface,
            responses: &mut responses,
            sink: &mut sink,
            abort: abort.clone(),
        };
        let report = TrialSequencer::new(quick_config(20), ctx).unwrap().run().unwrap();

        assert_eq!(report.aborted_in, Some(RunPhase::MemoryTest));
        assert_eq!(sink.memory.len(), 2);
        assert!(abort.load(Ordering::SeqCst));
    }

    #[test]
    fn sequencer_releases_even_when_aborted_before_start() {
        let (markers, outlet) = MarkerChannel::in_memory().unwrap();
        let mut surface = HeadlessSurface::new();
        let mut responses = ScriptedResponses::constant(Response::Yes);
        let mut sink = CollectingSink::default();
        let session = synthetic_session();

        let ctx = RunContext {
            session,
            markers,
            surface: &mut surface,
            responses: &mut responses,
            sink: &mut sink,
            abort: Arc::new(AtomicBool::new(true)),
        };
        let report = TrialSequencer::new(quick_config(5), ctx).unwrap().run().unwrap();

        assert_eq!(report.aborted_in, Some(RunPhase::Idle));
        assert!(outlet.published().is_empty());
        assert!(sink.events.is_empty());
    }

    #[test]
    fn config_rejects_marker_collisions_and_short_word_lists() {
        let too_many = RunConfig {
            n_trials: BASELINE_START as usize,
            words: (0..1000).map(|i| format!("w{}", i)).collect(),
            ..RunConfig::default()
        };
        assert!(too_many.validate().is_err());

        let short = RunConfig {
            n_trials: 31,
            ..RunConfig::default()
        };
        assert!(short.validate().is_err());

        let duplicated = RunConfig {
            n_trials: 2,
            words: vec!["a".to_string(), "a".to_string()],
            ..RunConfig::default()
        };
        assert!(duplicated.validate().is_err());

        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn released_session_rejects_reads() {
        let mut session = synthetic_session();
        session.release();
        assert_eq!(session.state(), SessionState::Released);
        assert!(matches!(session.read_buffered(), Err(SessionError::Closed)));
    }

    #[test]
    fn wait_returns_early_on_abort() {
        let abort = AtomicBool::new(true);
        let started = Instant::now();
        assert!(!wait_for(Duration::from_secs(5), &abort));
        assert!(started.elapsed() < Duration::from_secs(1));

        let clear = AtomicBool::new(false);
        assert!(wait_for(Duration::from_millis(10), &clear));
    }
}
