//! OpenBCI Cyton board over a serial dongle
//!
//! Streaming uses the board's 33-byte binary frames:
//!
//! ```text
//! [0xA0][counter][8 x 24-bit EEG][6 aux bytes][0xCx]
//! ```
//!
//! In analog-read mode (`/2`) the aux bytes carry the A5, A6 and A7 readings
//! as three big-endian 16-bit values, so every decoded frame has 8 EEG
//! channels in microvolts followed by 3 analog channels in raw counts.

use std::io;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use fs2::FileExt;

use super::{
    wall_clock_now, AcquisitionDevice, DeviceKind, FrameBuffer, ProducerThread,
    DEFAULT_SAMPLING_RATE,
};
use crate::error::{DeviceInitError, StreamControlError};
use crate::scanner::{read_until_terminator, ProbeTransport, ScanConfig};

pub const EEG_CHANNELS: usize = 8;
pub const ANALOG_CHANNELS: usize = 3;
pub const PACKET_SIZE: usize = 33;
pub const PACKET_HEADER: u8 = 0xA0;

const START_STREAM: &[u8] = b"b";
const STOP_STREAM: &[u8] = b"s";

/// Longest the reader keeps draining after a stop request
const STOP_DRAIN_LIMIT: Duration = Duration::from_millis(500);

/// Reset channel settings, clear board mode, enable analog reads
pub const CONFIG_COMMANDS: [&str; 3] = ["/0", "//", "/2"];

/// Microvolts per count at the default gain of 24
const SCALE_UV_PER_COUNT: f64 = 4.5 / 24.0 / 8_388_607.0 * 1_000_000.0;

/// Incremental decoder that resynchronizes on the header/footer pair
#[derive(Debug, Default)]
pub struct PacketDecoder {
    pending: Vec<u8>,
    last_counter: Option<u8>,
    dropped_packets: u64,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns the channel vectors of all complete frames
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<f64>> {
        self.pending.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            let Some(start) = self.pending.iter().position(|&b| b == PACKET_HEADER) else {
                self.pending.clear();
                break;
            };
            if start > 0 {
                self.pending.drain(..start);
            }
            if self.pending.len() < PACKET_SIZE {
                break;
            }

            let footer = self.pending[PACKET_SIZE - 1];
            if footer & 0xF0 != 0xC0 {
                // Header byte inside a payload; skip it and search again
                self.pending.drain(..1);
                continue;
            }

            let packet: Vec<u8> = self.pending.drain(..PACKET_SIZE).collect();
            self.track_counter(packet[1]);
            frames.push(decode_packet(&packet));
        }

        frames
    }

    /// Frames the board numbered but that never arrived intact
    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets
    }

    fn track_counter(&mut self, counter: u8) {
        if let Some(last) = self.last_counter {
            let expected = last.wrapping_add(1);
            if counter != expected {
                let gap = counter.wrapping_sub(expected) as u64;
                self.dropped_packets += gap;
                tracing::warn!(
                    "Cyton packet gap: expected counter {}, got {}",
                    expected,
                    counter
                );
            }
        }
        self.last_counter = Some(counter);
    }
}

fn decode_packet(packet: &[u8]) -> Vec<f64> {
    let mut channels = Vec::with_capacity(EEG_CHANNELS + ANALOG_CHANNELS);

    for ch in 0..EEG_CHANNELS {
        let offset = 2 + ch * 3;
        channels.push(i24_from_be(&packet[offset..offset + 3]) as f64 * SCALE_UV_PER_COUNT);
    }
    for ch in 0..ANALOG_CHANNELS {
        let offset = 26 + ch * 2;
        channels.push(u16::from_be_bytes([packet[offset], packet[offset + 1]]) as f64);
    }

    channels
}

fn i24_from_be(bytes: &[u8]) -> i32 {
    let raw = ((bytes[0] as i32) << 16) | ((bytes[1] as i32) << 8) | bytes[2] as i32;
    // Sign-extend from bit 23
    (raw << 8) >> 8
}

/// Serial transport the board streams over
///
/// The reader thread works on a clone of the port while the device keeps
/// the original for stream commands.
pub trait StreamPort: ProbeTransport + Send {
    /// Discard bytes received but not yet read
    fn clear_input(&mut self) -> io::Result<()>;

    fn try_clone_port(&self) -> io::Result<Box<dyn StreamPort>>;
}

impl StreamPort for Box<dyn serialport::SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn try_clone_port(&self) -> io::Result<Box<dyn StreamPort>> {
        let clone = self.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(clone))
    }
}

/// Assigns acquisition times to the frames decoded from one read
///
/// A read returns every frame that piled up since the previous one, so
/// frame `k` of `n` is stamped `period * (n - 1 - k)` before the arrival
/// time. Stamps never repeat or go backwards: a frame that would land at or
/// before its predecessor is placed one period after it.
#[derive(Debug, Clone)]
pub struct FrameClock {
    period: f64,
    last: Option<f64>,
}

impl FrameClock {
    pub fn new(sampling_rate: f64) -> Self {
        Self {
            period: 1.0 / sampling_rate,
            last: None,
        }
    }

    pub fn stamp(&mut self, received_at: f64, count: usize) -> Vec<f64> {
        (0..count)
            .map(|k| {
                let mut timestamp = received_at - (count - 1 - k) as f64 * self.period;
                if let Some(last) = self.last
                    && timestamp <= last
                {
                    timestamp = last + self.period;
                }
                self.last = Some(timestamp);
                timestamp
            })
            .collect()
    }
}

pub struct CytonDevice {
    address: String,
    config: ScanConfig,
    port: Option<Box<dyn StreamPort>>,
    lock: Option<std::fs::File>,
    producer: Option<ProducerThread>,
}

impl CytonDevice {
    pub fn new(address: impl Into<String>, config: ScanConfig) -> Self {
        Self {
            address: address.into(),
            config,
            port: None,
            lock: None,
            producer: None,
        }
    }

    /// Device on a transport that is already open; `prepare` only takes the lock
    pub fn with_port(
        address: impl Into<String>,
        config: ScanConfig,
        port: Box<dyn StreamPort>,
    ) -> Self {
        Self {
            port: Some(port),
            ..Self::new(address, config)
        }
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn StreamPort>, StreamControlError> {
        self.port.as_mut().ok_or_else(|| {
            StreamControlError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "serial port is not open",
            ))
        })
    }

    /// Take an exclusive lock file for this address in the temp directory
    fn lock_address(&self) -> Result<std::fs::File, DeviceInitError> {
        let sanitized: String = self
            .address
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let lock_path = std::env::temp_dir().join(format!("eeg-trial-toolbox-{}.lock", sanitized));
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;
        lock_file.try_lock_exclusive().map_err(|_| DeviceInitError::Lock {
            address: self.address.clone(),
        })?;
        Ok(lock_file)
    }
}

impl AcquisitionDevice for CytonDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Cyton
    }

    fn address(&self) -> Option<&str> {
        Some(&self.address)
    }

    fn channel_count(&self) -> usize {
        EEG_CHANNELS + ANALOG_CHANNELS
    }

    fn sampling_rate(&self) -> f64 {
        DEFAULT_SAMPLING_RATE
    }

    fn is_streaming(&self) -> bool {
        self.producer.is_some()
    }

    fn prepare(&mut self) -> Result<(), DeviceInitError> {
        let lock = self.lock_address()?;
        if self.port.is_some() {
            self.lock = Some(lock);
            return Ok(());
        }

        let port = serialport::new(&self.address, self.config.baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|source| DeviceInitError::Serial {
                address: self.address.clone(),
                source,
            })?;
        port.clear(serialport::ClearBuffer::All)
            .map_err(|source| DeviceInitError::Serial {
                address: self.address.clone(),
                source,
            })?;

        tracing::info!("Opened {} at {} baud", self.address, self.config.baud_rate);
        self.port = Some(Box::new(port));
        self.lock = Some(lock);
        Ok(())
    }

    fn configure(&mut self) -> Result<Vec<String>, DeviceInitError> {
        let timeout = self.config.response_timeout;
        let terminator = self.config.terminator.clone();
        let port = self.port.as_mut().ok_or_else(|| DeviceInitError::Handshake {
            command: CONFIG_COMMANDS[0].to_string(),
            reason: "serial port is not open".to_string(),
        })?;

        let mut responses = Vec::with_capacity(CONFIG_COMMANDS.len());
        for command in CONFIG_COMMANDS {
            port.send(command.as_bytes())?;
            let response = read_until_terminator(&mut **port, &terminator, Some(timeout))?;
            tracing::info!("Config {} -> {}", command, response.trim());
            responses.push(response);
        }
        Ok(responses)
    }

    fn start_stream(&mut self, sink: Arc<FrameBuffer>) -> Result<(), StreamControlError> {
        if self.producer.is_some() {
            return Ok(());
        }

        let rate = self.sampling_rate();
        let port = self.port_mut()?;
        // Leftovers from an earlier run would otherwise lead the new record
        port.clear_input()?;
        port.send(START_STREAM)?;
        let mut reader = port.try_clone_port()?;

        let producer = ProducerThread::spawn("cyton-reader", move |stop: Arc<AtomicBool>| {
            let mut decoder = PacketDecoder::new();
            let mut clock = FrameClock::new(rate);
            let mut chunk = [0u8; 512];

            // After the stop flag, keep reading until the port goes quiet so
            // packets sent before the board saw `s` land in this run's sink
            let mut drain_deadline: Option<Instant> = None;
            loop {
                let stopping = stop.load(Ordering::SeqCst);
                if stopping {
                    let deadline =
                        *drain_deadline.get_or_insert_with(|| Instant::now() + STOP_DRAIN_LIMIT);
                    if Instant::now() >= deadline {
                        tracing::warn!("Cyton kept sending after stop; dropping the rest");
                        break;
                    }
                }
                match reader.read_chunk(&mut chunk) {
                    Ok(0) if stopping => break,
                    Ok(0) => {}
                    Ok(n) => {
                        let received_at = wall_clock_now();
                        let frames = decoder.push(&chunk[..n]);
                        let stamps = clock.stamp(received_at, frames.len());
                        for (timestamp, channels) in stamps.into_iter().zip(frames) {
                            sink.ingest(timestamp, channels);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                        if stopping {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Cyton read error, ending stream: {}", e);
                        break;
                    }
                }
            }

            if decoder.dropped_packets() > 0 {
                tracing::warn!("Cyton stream lost {} packet(s)", decoder.dropped_packets());
            }
        })?;

        self.producer = Some(producer);
        Ok(())
    }

    /// Send `s` first, then let the reader drain the tail and exit
    ///
    /// When the command cannot be written the reader keeps running and the
    /// device still reports itself as streaming.
    fn stop_stream(&mut self) -> Result<(), StreamControlError> {
        if self.producer.is_none() {
            return Ok(());
        }
        self.port_mut()?.send(STOP_STREAM)?;

        match self.producer.take() {
            Some(producer) => producer.stop(),
            None => Ok(()),
        }
    }

    fn release(&mut self) {
        if self.port.is_none() {
            return;
        }
        if let Err(e) = self.stop_stream() {
            tracing::warn!("Failed to stop Cyton stream during release: {}", e);
        }
        if let Some(producer) = self.producer.take()
            && producer.stop().is_err()
        {
            tracing::warn!("Cyton reader panicked during release");
        }
        self.port = None;
        if let Some(lock) = self.lock.take() {
            let _ = lock.unlock();
        }
        tracing::info!("Released {}", self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SampleFrame;
    use std::collections::VecDeque;
    use std::sync::{Mutex, MutexGuard};
    use std::thread;

    fn packet(counter: u8, eeg: [i32; 8], analog: [u16; 3]) -> Vec<u8> {
        let mut bytes = vec![PACKET_HEADER, counter];
        for value in eeg {
            let be = value.to_be_bytes();
            bytes.extend_from_slice(&be[1..4]);
        }
        for value in analog {
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        bytes.push(0xC1);
        bytes
    }

    #[test]
    fn decodes_signed_counts_and_analog_values() {
        let mut decoder = PacketDecoder::new();
        let frames = decoder.push(&packet(0, [1, -1, 0, 0, 0, 0, 0, 8_388_607], [512, 0, 1023]));

        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.len(), EEG_CHANNELS + ANALOG_CHANNELS);
        assert!((frame[0] - SCALE_UV_PER_COUNT).abs() < 1e-12);
        assert!((frame[1] + SCALE_UV_PER_COUNT).abs() < 1e-12);
        assert!((frame[7] - 4.5 / 24.0 * 1e6).abs() < 1e-6);
        assert_eq!(&frame[8..], &[512.0, 0.0, 1023.0]);
    }

    #[test]
    fn resynchronizes_across_split_reads_and_garbage() {
        let mut decoder = PacketDecoder::new();
        let mut stream = vec![0x00, 0x13, 0x37];
        stream.extend(packet(7, [10; 8], [1, 2, 3]));
        stream.extend(packet(8, [20; 8], [4, 5, 6]));

        let (head, tail) = stream.split_at(20);
        let mut frames = decoder.push(head);
        assert!(frames.is_empty());
        frames.extend(decoder.push(tail));

        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[1][8..], &[4.0, 5.0, 6.0]);
        assert_eq!(decoder.dropped_packets(), 0);
    }

    #[test]
    fn counts_counter_gaps() {
        let mut decoder = PacketDecoder::new();
        decoder.push(&packet(254, [0; 8], [0; 3]));
        decoder.push(&packet(2, [0; 8], [0; 3]));
        assert_eq!(decoder.dropped_packets(), 3);
    }

    /// Marks packets the board sent after it was told to stop
    const TAIL_MARK: u16 = 1;

    #[derive(Default)]
    struct WireState {
        inbox: VecDeque<u8>,
        streaming: bool,
        counter: u8,
        tail_on_stop: usize,
        fail_stop: bool,
        cleared: usize,
    }

    /// Board that emits one packet per read while streaming and still has
    /// `tail_on_stop` packets in flight when `s` arrives
    #[derive(Clone)]
    struct ScriptedBoard(Arc<Mutex<WireState>>);

    impl ScriptedBoard {
        fn new(tail_on_stop: usize) -> Self {
            Self(Arc::new(Mutex::new(WireState {
                tail_on_stop,
                ..WireState::default()
            })))
        }

        fn state(&self) -> MutexGuard<'_, WireState> {
            self.0.lock().unwrap()
        }
    }

    fn queue_packet(state: &mut WireState, mark: u16) {
        let bytes = packet(state.counter, [0; 8], [mark, 0, 0]);
        state.counter = state.counter.wrapping_add(1);
        state.inbox.extend(bytes);
    }

    impl ProbeTransport for ScriptedBoard {
        fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
            let mut state = self.state();
            match bytes {
                b"b" => state.streaming = true,
                b"s" => {
                    if state.fail_stop {
                        return Err(io::Error::new(io::ErrorKind::BrokenPipe, "dongle unplugged"));
                    }
                    for _ in 0..state.tail_on_stop {
                        queue_packet(&mut state, TAIL_MARK);
                    }
                    state.streaming = false;
                }
                _ => {}
            }
            Ok(())
        }

        fn buffered(&mut self) -> io::Result<usize> {
            Ok(self.state().inbox.len())
        }

        fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(2));
            let mut state = self.state();
            if state.streaming {
                queue_packet(&mut state, 0);
            }
            if state.inbox.is_empty() {
                return Err(io::ErrorKind::TimedOut.into());
            }
            let n = buf.len().min(state.inbox.len());
            for (slot, byte) in buf.iter_mut().zip(state.inbox.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl StreamPort for ScriptedBoard {
        fn clear_input(&mut self) -> io::Result<()> {
            let mut state = self.state();
            state.inbox.clear();
            state.cleared += 1;
            Ok(())
        }

        fn try_clone_port(&self) -> io::Result<Box<dyn StreamPort>> {
            Ok(Box::new(self.clone()))
        }
    }

    fn scripted_device(board: &ScriptedBoard) -> CytonDevice {
        CytonDevice::with_port(
            format!("scripted-{}", fastrand::u64(..)),
            ScanConfig::default(),
            Box::new(board.clone()),
        )
    }

    fn tail_frames(frames: &[SampleFrame]) -> usize {
        frames
            .iter()
            .filter(|f| f.channels[EEG_CHANNELS] == TAIL_MARK as f64)
            .count()
    }

    #[test]
    fn restart_does_not_lead_with_the_previous_tail() {
        let board = ScriptedBoard::new(5);
        let mut device = scripted_device(&board);

        let baseline = Arc::new(FrameBuffer::new());
        device.start_stream(baseline.clone()).unwrap();
        thread::sleep(Duration::from_millis(50));
        device.stop_stream().unwrap();
        assert!(!device.is_streaming());

        // Bytes that show up after the reader already exited
        queue_packet(&mut board.state(), TAIL_MARK);

        let main = Arc::new(FrameBuffer::new());
        device.start_stream(main.clone()).unwrap();
        thread::sleep(Duration::from_millis(50));
        device.stop_stream().unwrap();
        device.release();

        let baseline_frames = baseline.drain();
        let main_frames = main.drain();
        assert_eq!(tail_frames(&baseline_frames), 5);
        assert_eq!(
            &baseline_frames[baseline_frames.len() - 5..]
                .iter()
                .map(|f| f.channels[EEG_CHANNELS])
                .collect::<Vec<_>>(),
            &[TAIL_MARK as f64; 5]
        );

        // Only this run's own tail, at the very end
        assert!(main_frames.len() > 5);
        assert_eq!(tail_frames(&main_frames[..main_frames.len() - 5]), 0);
        assert_eq!(tail_frames(&main_frames), 5);
        assert_eq!(board.state().cleared, 2);
    }

    #[test]
    fn streamed_timestamps_strictly_increase() {
        let board = ScriptedBoard::new(3);
        let mut device = scripted_device(&board);
        let sink = Arc::new(FrameBuffer::new());

        device.start_stream(sink.clone()).unwrap();
        thread::sleep(Duration::from_millis(60));
        device.stop_stream().unwrap();

        let frames = sink.drain();
        assert!(frames.len() > 3);
        assert!(frames.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(sink.non_monotonic_count(), 0);
    }

    #[test]
    fn failed_stop_command_keeps_the_reader_running() {
        let board = ScriptedBoard::new(0);
        board.state().fail_stop = true;
        let mut device = scripted_device(&board);
        let sink = Arc::new(FrameBuffer::new());

        device.start_stream(sink.clone()).unwrap();
        assert!(device.stop_stream().is_err());
        assert!(device.is_streaming());

        let before = sink.ingested();
        thread::sleep(Duration::from_millis(40));
        assert!(sink.ingested() > before);

        board.state().fail_stop = false;
        device.stop_stream().unwrap();
        assert!(!device.is_streaming());
    }

    #[test]
    fn frames_from_one_read_are_back_dated_one_period_apart() {
        let mut clock = FrameClock::new(250.0);
        let first = clock.stamp(10.0, 5);
        assert!((first[0] - 9.984).abs() < 1e-9);
        assert_eq!(first[4], 10.0);

        // A burst right behind the previous read is pushed past it
        let second = clock.stamp(10.004, 3);
        assert!((second[0] - 10.004).abs() < 1e-9);
        assert!((second[2] - 10.012).abs() < 1e-9);

        let all: Vec<f64> = first.into_iter().chain(second).collect();
        assert!(all.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn second_device_on_a_locked_address_is_rejected() {
        let address = format!("scripted-{}", fastrand::u64(..));
        let mut first = CytonDevice::with_port(
            address.clone(),
            ScanConfig::default(),
            Box::new(ScriptedBoard::new(0)),
        );
        first.prepare().unwrap();

        let mut second =
            CytonDevice::with_port(address, ScanConfig::default(), Box::new(ScriptedBoard::new(0)));
        assert!(matches!(second.prepare(), Err(DeviceInitError::Lock { .. })));
        first.release();
    }

    #[test]
    #[ignore] // Requires a Cyton dongle; set EEG_TEST_PORT
    fn streams_from_hardware() {
        let Ok(address) = std::env::var("EEG_TEST_PORT") else {
            return;
        };
        let mut device = CytonDevice::new(address, ScanConfig::default());
        device.prepare().unwrap();
        device.configure().unwrap();
        let buffer = Arc::new(FrameBuffer::new());
        device.start_stream(buffer.clone()).unwrap();
        std::thread::sleep(Duration::from_secs(1));
        device.stop_stream().unwrap();
        device.release();
        assert!(buffer.pending() > 100);
    }
}
