//! Serial device discovery
//!
//! Enumerates the platform's candidate ports and probes each one with the
//! board's identification handshake: write `v`, wait for the board to
//! settle, then read until the `$$$` terminator or until the port has
//! nothing more buffered. A port is accepted when the text before the
//! terminator contains the vendor string.
//!
//! Probe failures are per candidate and never abort the scan. A scan that
//! finds nothing yields `None`, which callers treat as "use the synthetic
//! device".

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::DiscoveryError;

/// Identification and handshake settings
#[derive(Debug, Clone, Serialize)]
pub struct ScanConfig {
    pub baud_rate: u32,
    /// Read timeout of the transport while identifying
    pub identification_timeout: Duration,
    /// Pause between writing the identification byte and reading
    pub settle: Duration,
    pub vendor: String,
    pub terminator: String,
    /// Upper bound on waiting for a configuration command's response
    pub response_timeout: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            identification_timeout: Duration::from_secs(2),
            settle: Duration::from_secs(2),
            vendor: "OpenBCI".to_string(),
            terminator: "$$$".to_string(),
            response_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CandidateState {
    Unprobed,
    ProbeFailed,
    Identified,
    IdentifiedNotTarget,
}

/// A transport address considered during one enumeration pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceCandidate {
    pub address: String,
    pub state: CandidateState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(any(target_os = "linux", target_os = "android")) {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Other
        }
    }

    /// Device-file glob for platforms that expose ports under /dev
    pub fn device_pattern(&self) -> Option<&'static str> {
        match self {
            Platform::Linux => Some("/dev/ttyUSB*"),
            Platform::MacOs => Some("/dev/cu.usbserial*"),
            Platform::Windows | Platform::Other => None,
        }
    }
}

/// Candidate ports for a platform, in probing order
pub fn candidate_addresses(platform: Platform) -> Result<Vec<String>, DiscoveryError> {
    match platform {
        Platform::Windows => Ok((1..=256).map(|i| format!("COM{}", i)).collect()),
        Platform::Linux | Platform::MacOs => {
            let pattern = platform
                .device_pattern()
                .ok_or(DiscoveryError::UnsupportedPlatform)?;
            let paths = glob::glob(pattern).map_err(|e| {
                DiscoveryError::Io(io::Error::new(io::ErrorKind::InvalidInput, e))
            })?;
            let mut addresses: Vec<String> = paths
                .flatten()
                .map(|p| p.display().to_string())
                .collect();
            addresses.sort();
            Ok(addresses)
        }
        Platform::Other => Err(DiscoveryError::UnsupportedPlatform),
    }
}

/// Minimal byte transport used by the identification and config handshakes
pub trait ProbeTransport {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Bytes received and not yet read
    fn buffered(&mut self) -> io::Result<usize>;

    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl ProbeTransport for Box<dyn serialport::SerialPort> {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)?;
        self.flush()
    }

    fn buffered(&mut self) -> io::Result<usize> {
        self.bytes_to_read().map(|n| n as usize).map_err(io::Error::from)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }
}

/// Accumulate text until `terminator` appears
///
/// Without a deadline, reading ends as soon as the transport has nothing
/// buffered. With a deadline, an empty transport is polled until the
/// deadline passes. The returned text is cut before the terminator.
pub fn read_until_terminator<T: ProbeTransport + ?Sized>(
    transport: &mut T,
    terminator: &str,
    timeout: Option<Duration>,
) -> io::Result<String> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut raw: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 64];

    loop {
        let text = String::from_utf8_lossy(&raw);
        if let Some(pos) = text.find(terminator) {
            return Ok(text[..pos].to_string());
        }

        if transport.buffered()? == 0 {
            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
                _ => return Ok(text.into_owned()),
            }
        }

        match transport.read_chunk(&mut chunk) {
            Ok(n) => raw.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e),
        }
    }
}

/// Run the identification handshake on an already opened transport
pub fn probe<T: ProbeTransport + ?Sized>(
    transport: &mut T,
    config: &ScanConfig,
) -> Result<CandidateState, DiscoveryError> {
    transport.send(b"v")?;
    if !config.settle.is_zero() {
        thread::sleep(config.settle);
    }

    if transport.buffered()? == 0 {
        return Ok(CandidateState::IdentifiedNotTarget);
    }

    let response = read_until_terminator(transport, &config.terminator, None)?;
    if response.contains(&config.vendor) {
        Ok(CandidateState::Identified)
    } else {
        Ok(CandidateState::IdentifiedNotTarget)
    }
}

/// Open a real serial port for probing
pub fn open_serial(
    address: &str,
    config: &ScanConfig,
) -> Result<Box<dyn ProbeTransport>, DiscoveryError> {
    let port = serialport::new(address, config.baud_rate)
        .timeout(config.identification_timeout)
        .open()?;
    Ok(Box::new(port))
}

/// Probe `addresses` in order, optionally stopping at the first accepted one
///
/// Every opened transport is dropped (closed) before the next candidate is
/// tried.
pub fn scan_candidates<F>(
    addresses: &[String],
    config: &ScanConfig,
    stop_at_first: bool,
    mut open: F,
) -> Vec<DeviceCandidate>
where
    F: FnMut(&str, &ScanConfig) -> Result<Box<dyn ProbeTransport>, DiscoveryError>,
{
    let mut candidates: Vec<DeviceCandidate> = addresses
        .iter()
        .map(|address| DeviceCandidate {
            address: address.clone(),
            state: CandidateState::Unprobed,
        })
        .collect();

    for candidate in candidates.iter_mut() {
        let outcome = open(&candidate.address, config).and_then(|mut transport| {
            let result = probe(transport.as_mut(), config);
            drop(transport);
            result
        });

        candidate.state = match outcome {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!("Probe of {} failed: {}", candidate.address, e);
                CandidateState::ProbeFailed
            }
        };

        if stop_at_first && candidate.state == CandidateState::Identified {
            break;
        }
    }

    candidates
}

/// Find the first port that identifies as the target board
pub fn discover(config: &ScanConfig) -> Option<String> {
    let addresses = match candidate_addresses(Platform::current()) {
        Ok(addresses) => addresses,
        Err(e) => {
            tracing::warn!("Cannot enumerate serial ports: {}", e);
            return None;
        }
    };
    tracing::debug!("Probing {} candidate port(s)", addresses.len());

    scan_candidates(&addresses, config, true, open_serial)
        .into_iter()
        .find(|c| c.state == CandidateState::Identified)
        .map(|c| c.address)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedPort {
        reply: Vec<u8>,
        cursor: usize,
        identified: bool,
    }

    impl ScriptedPort {
        fn boxed(reply: &str) -> Box<dyn ProbeTransport> {
            Box::new(Self {
                reply: reply.as_bytes().to_vec(),
                cursor: 0,
                identified: false,
            })
        }
    }

    impl ProbeTransport for ScriptedPort {
        fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.identified |= bytes == b"v";
            Ok(())
        }

        fn buffered(&mut self) -> io::Result<usize> {
            Ok(if self.identified { self.reply.len() - self.cursor } else { 0 })
        }

        fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            // One byte at a time, like a slow UART
            if self.cursor >= self.reply.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.reply[self.cursor];
            self.cursor += 1;
            Ok(1)
        }
    }

    fn fast_config() -> ScanConfig {
        ScanConfig {
            settle: Duration::ZERO,
            ..ScanConfig::default()
        }
    }

    #[test]
    fn accepts_vendor_before_terminator() {
        let mut port = ScriptedPort::boxed("OpenBCI V3 8-16 channel\nOn Board ADS1299 Device ID: 0x3E\n$$$");
        assert_eq!(probe(port.as_mut(), &fast_config()).unwrap(), CandidateState::Identified);
    }

    #[test]
    fn vendor_after_terminator_is_rejected() {
        let mut port = ScriptedPort::boxed("Arduino Uno$$$OpenBCI");
        assert_eq!(
            probe(port.as_mut(), &fast_config()).unwrap(),
            CandidateState::IdentifiedNotTarget
        );
    }

    #[test]
    fn silent_port_is_rejected() {
        let mut port = ScriptedPort::boxed("");
        assert_eq!(
            probe(port.as_mut(), &fast_config()).unwrap(),
            CandidateState::IdentifiedNotTarget
        );
    }

    #[test]
    fn unterminated_reply_stops_when_drained() {
        let mut port = ScriptedPort::boxed("OpenBCI without terminator");
        assert_eq!(probe(port.as_mut(), &fast_config()).unwrap(), CandidateState::Identified);
    }

    #[test]
    fn transport_errors_do_not_abort_the_scan() {
        let addresses: Vec<String> = ["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyUSB2", "/dev/ttyUSB3"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mut opened = Vec::new();
        let candidates = scan_candidates(&addresses, &fast_config(), true, |address, _| {
            opened.push(address.to_string());
            match address {
                "/dev/ttyUSB0" => Err(DiscoveryError::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "denied",
                ))),
                "/dev/ttyUSB1" => Ok(ScriptedPort::boxed("GPS receiver$$$")),
                _ => Ok(ScriptedPort::boxed("OpenBCI V3$$$")),
            }
        });

        assert_eq!(candidates[0].state, CandidateState::ProbeFailed);
        assert_eq!(candidates[1].state, CandidateState::IdentifiedNotTarget);
        assert_eq!(candidates[2].state, CandidateState::Identified);
        assert_eq!(candidates[3].state, CandidateState::Unprobed);
        assert_eq!(opened.len(), 3);
    }

    #[test]
    fn exhausted_scan_yields_nothing() {
        let addresses = vec!["COM1".to_string(), "COM2".to_string()];
        let candidates = scan_candidates(&addresses, &fast_config(), true, |_, _| {
            Err(DiscoveryError::Io(io::Error::new(io::ErrorKind::NotFound, "no such device")))
        });
        assert!(candidates.iter().all(|c| c.state == CandidateState::ProbeFailed));
    }

    #[test]
    fn windows_candidates_are_bounded() {
        let addresses = candidate_addresses(Platform::Windows).unwrap();
        assert_eq!(addresses.len(), 256);
        assert_eq!(addresses[0], "COM1");
        assert_eq!(addresses[255], "COM256");
    }

    #[test]
    fn config_response_waits_until_deadline() {
        let mut port = ScriptedPort::boxed("Success: analog$$$");
        port.send(b"v").unwrap();
        let text = read_until_terminator(port.as_mut(), "$$$", Some(Duration::from_millis(50))).unwrap();
        assert_eq!(text, "Success: analog");
    }
}
