use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use super::{
    wall_clock_now, AcquisitionDevice, DeviceKind, FrameBuffer, ProducerThread,
    DEFAULT_SAMPLING_RATE,
};
use crate::error::{DeviceInitError, StreamControlError};

/// In-memory stand-in used when no board answers the identification probe
///
/// Generates sine waves (1-10 Hz spread over the channels) with a little
/// noise at the nominal rate. Timestamps are host wall-clock seconds, spaced
/// exactly one sample period apart from the moment the stream starts.
pub struct SyntheticDevice {
    channels: usize,
    sampling_rate: f64,
    chunk_interval: Duration,
    /// Samples generated so far, kept across stop/start for phase continuity
    generated: Arc<AtomicU64>,
    producer: Option<ProducerThread>,
    released: bool,
}

impl SyntheticDevice {
    pub fn new(channels: usize) -> Self {
        Self::with_rate(channels, DEFAULT_SAMPLING_RATE)
    }

    pub fn with_rate(channels: usize, sampling_rate: f64) -> Self {
        Self {
            channels: channels.max(1),
            sampling_rate,
            chunk_interval: Duration::from_millis(20),
            generated: Arc::new(AtomicU64::new(0)),
            producer: None,
            released: false,
        }
    }

    fn channel_frequencies(&self) -> Vec<f64> {
        let (min_freq, max_freq) = (1.0, 10.0);
        if self.channels == 1 {
            vec![(min_freq + max_freq) / 2.0]
        } else {
            (0..self.channels)
                .map(|i| min_freq + (max_freq - min_freq) * i as f64 / (self.channels - 1) as f64)
                .collect()
        }
    }
}

impl AcquisitionDevice for SyntheticDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Synthetic
    }

    fn address(&self) -> Option<&str> {
        None
    }

    fn channel_count(&self) -> usize {
        self.channels
    }

    fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    fn prepare(&mut self) -> Result<(), DeviceInitError> {
        tracing::info!(
            "Prepared synthetic device: {} channels at {} Hz",
            self.channels,
            self.sampling_rate
        );
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.producer.is_some()
    }

    fn start_stream(&mut self, sink: Arc<FrameBuffer>) -> Result<(), StreamControlError> {
        if self.producer.is_some() {
            return Ok(());
        }

        let frequencies = self.channel_frequencies();
        let rate = self.sampling_rate;
        let chunk_interval = self.chunk_interval;
        let generated = self.generated.clone();

        let producer = ProducerThread::spawn("synthetic-device", move |stop: Arc<AtomicBool>| {
            let started = Instant::now();
            let anchor = wall_clock_now();
            let mut rng = fastrand::Rng::new();
            let mut produced_this_run = 0u64;

            while !stop.load(Ordering::SeqCst) {
                let due = (started.elapsed().as_secs_f64() * rate) as u64;
                while produced_this_run < due {
                    let index = generated.fetch_add(1, Ordering::SeqCst);
                    let phase_time = index as f64 / rate;
                    let timestamp = anchor + produced_this_run as f64 / rate;

                    let sample: Vec<f64> = frequencies
                        .iter()
                        .map(|freq| {
                            let amplitude = 20.0
                                + 10.0 * (2.0 * std::f64::consts::PI * 0.1 * freq * phase_time).sin();
                            amplitude * (2.0 * std::f64::consts::PI * freq * phase_time).sin()
                                + (rng.f64() - 0.5) * 2.0
                        })
                        .collect();

                    sink.ingest(timestamp, sample);
                    produced_this_run += 1;
                }
                thread::sleep(chunk_interval);
            }
        })?;

        self.producer = Some(producer);
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), StreamControlError> {
        match self.producer.take() {
            Some(producer) => producer.stop(),
            None => Ok(()),
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.stop_stream() {
            tracing::warn!("Synthetic producer did not stop cleanly: {}", e);
        }
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_frames_at_nominal_spacing() {
        let mut device = SyntheticDevice::new(4);
        let buffer = Arc::new(FrameBuffer::new());
        device.prepare().unwrap();
        device.start_stream(buffer.clone()).unwrap();
        thread::sleep(Duration::from_millis(120));
        device.stop_stream().unwrap();

        let frames = buffer.drain();
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| f.channels.len() == 4));
        for pair in frames.windows(2) {
            let dt = pair[1].timestamp - pair[0].timestamp;
            assert!((dt - 1.0 / 250.0).abs() < 1e-6);
        }
    }

    #[test]
    fn stop_halts_ingestion() {
        let mut device = SyntheticDevice::new(2);
        let buffer = Arc::new(FrameBuffer::new());
        device.start_stream(buffer.clone()).unwrap();
        thread::sleep(Duration::from_millis(50));
        device.stop_stream().unwrap();

        let after_stop = buffer.ingested();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(buffer.ingested(), after_stop);
        device.release();
        device.release();
    }
}
