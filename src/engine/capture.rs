//! Frame sources
//!
//! - `MemorySource`: in-memory frames (tests, demos)
//! - `PcapFileSource`: offline pcap replay
//! - `LiveCapture`: libpcap capture on an interface (feature `live`)

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use pcap_file::pcap::PcapReader;
use pcap_file::DataLink;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::event::RawFrame;
use crate::error::{Error, Result};

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Interface for live capture
    #[serde(default)]
    pub interface: Option<String>,
    /// PCAP file for replay
    #[serde(default)]
    pub pcap_file: Option<PathBuf>,
    /// Snapshot length
    #[serde(default = "default_snaplen")]
    pub snaplen: u32,
    /// Enable promiscuous mode
    #[serde(default = "default_promiscuous")]
    pub promiscuous: bool,
    /// Read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u32,
}

fn default_snaplen() -> u32 { 65535 }
fn default_promiscuous() -> bool { true }
fn default_timeout_ms() -> u32 { 100 }

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: None,
            pcap_file: None,
            snaplen: default_snaplen(),
            promiscuous: default_promiscuous(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Which clock drives debounce expiry for a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    /// Wall-clock time (live capture)
    Wall,
    /// Newest frame timestamp seen (replay)
    EventTime,
}

/// Outcome of one read from a source
#[derive(Debug)]
pub enum CaptureEvent {
    Frame(RawFrame),
    /// Nothing arrived within the read timeout
    Timeout,
    /// Source exhausted; the engine shuts down
    EndOfStream,
}

/// Capture statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStats {
    /// Frames read from the source
    pub received: u64,
    /// Frames dropped by the kernel
    pub dropped: u64,
    /// Interface drops
    pub if_dropped: u64,
}

/// Trait for frame sources. Runs on the dedicated capture thread.
pub trait CaptureSource: Send {
    fn name(&self) -> &str;

    /// Read the next frame, blocking at most the source's read timeout
    fn next_frame(&mut self) -> Result<CaptureEvent>;

    fn clock(&self) -> ClockMode;

    fn stats(&self) -> CaptureStats;

    fn close(&mut self);
}

/// Build the source named by the configuration: a pcap file wins over an
/// interface.
pub fn create_source(config: &CaptureConfig) -> Result<Box<dyn CaptureSource>> {
    if let Some(path) = &config.pcap_file {
        return Ok(Box::new(PcapFileSource::open(path)?));
    }

    match &config.interface {
        #[cfg(feature = "live")]
        Some(_) => Ok(Box::new(live::LiveCapture::open(config)?)),
        #[cfg(not(feature = "live"))]
        Some(iface) => Err(Error::Capture(format!(
            "live capture on {} requires the 'live' feature",
            iface
        ))),
        None => Err(Error::Capture(
            "no capture source configured (interface or pcap_file)".to_string(),
        )),
    }
}

/// Frames held in memory
pub struct MemorySource {
    name: String,
    interface: Arc<str>,
    frames: VecDeque<RawFrame>,
    clock: ClockMode,
    stats: CaptureStats,
}

impl MemorySource {
    pub fn new(interface: &str) -> Self {
        Self {
            name: format!("memory:{}", interface),
            interface: Arc::from(interface),
            frames: VecDeque::new(),
            clock: ClockMode::EventTime,
            stats: CaptureStats::default(),
        }
    }

    pub fn with_clock(mut self, clock: ClockMode) -> Self {
        self.clock = clock;
        self
    }

    /// Queue raw frame bytes received at `timestamp`
    pub fn push(&mut self, data: Vec<u8>, timestamp: DateTime<Utc>) {
        let frame = RawFrame::new(data, timestamp, self.interface.clone());
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl CaptureSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_frame(&mut self) -> Result<CaptureEvent> {
        match self.frames.pop_front() {
            Some(frame) => {
                self.stats.received += 1;
                Ok(CaptureEvent::Frame(frame))
            }
            None => Ok(CaptureEvent::EndOfStream),
        }
    }

    fn clock(&self) -> ClockMode {
        self.clock
    }

    fn stats(&self) -> CaptureStats {
        self.stats.clone()
    }

    fn close(&mut self) {
        self.frames.clear();
    }
}

/// Offline replay of a pcap file; timestamps come from the file
pub struct PcapFileSource {
    name: String,
    interface: Arc<str>,
    reader: Option<PcapReader<BufReader<File>>>,
    stats: CaptureStats,
}

impl PcapFileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::Capture(format!("cannot open {}: {}", path.display(), e)))?;
        let reader = PcapReader::new(BufReader::new(file))
            .map_err(|e| Error::Capture(format!("{}: {}", path.display(), e)))?;

        let datalink = reader.header().datalink;
        if datalink != DataLink::ETHERNET {
            return Err(Error::Capture(format!(
                "{}: unsupported link type {:?}",
                path.display(),
                datalink
            )));
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        debug!("replaying {}", path.display());

        Ok(Self {
            name: format!("pcap:{}", file_name),
            interface: Arc::from(file_name.as_str()),
            reader: Some(reader),
            stats: CaptureStats::default(),
        })
    }
}

impl CaptureSource for PcapFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_frame(&mut self) -> Result<CaptureEvent> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(CaptureEvent::EndOfStream);
        };

        let next = match reader.next_packet() {
            Some(Ok(packet)) => Ok(Some((packet.timestamp, packet.data.into_owned()))),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        };

        match next {
            Ok(Some((ts, data))) => {
                self.stats.received += 1;
                let frame = RawFrame::new(data, pcap_timestamp(ts), self.interface.clone());
                Ok(CaptureEvent::Frame(frame))
            }
            Ok(None) => {
                self.reader = None;
                Ok(CaptureEvent::EndOfStream)
            }
            Err(e) => {
                // A truncated trailing record ends the replay
                warn!("{}: read error, ending replay: {}", self.name, e);
                self.reader = None;
                Ok(CaptureEvent::EndOfStream)
            }
        }
    }

    fn clock(&self) -> ClockMode {
        ClockMode::EventTime
    }

    fn stats(&self) -> CaptureStats {
        self.stats.clone()
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

fn pcap_timestamp(since_epoch: std::time::Duration) -> DateTime<Utc> {
    let secs = i64::try_from(since_epoch.as_secs()).unwrap_or(i64::MAX);
    Utc.timestamp_opt(secs, since_epoch.subsec_nanos())
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(feature = "live")]
pub mod live {
    //! libpcap capture restricted to ARP by a BPF filter

    use std::sync::Arc;

    use chrono::Utc;

    use super::{CaptureConfig, CaptureEvent, CaptureSource, CaptureStats, ClockMode};
    use crate::core::event::RawFrame;
    use crate::error::{Error, Result};

    pub struct LiveCapture {
        name: String,
        interface: Arc<str>,
        cap: Option<pcap::Capture<pcap::Active>>,
        stats: CaptureStats,
    }

    impl LiveCapture {
        pub fn open(config: &CaptureConfig) -> Result<Self> {
            let iface = config
                .interface
                .clone()
                .ok_or_else(|| Error::Capture("interface required".to_string()))?;

            let mut cap = pcap::Capture::from_device(iface.as_str())
                .map_err(|e| Error::Capture(e.to_string()))?
                .promisc(config.promiscuous)
                .snaplen(config.snaplen as i32)
                .timeout(config.timeout_ms as i32)
                .open()
                .map_err(|e| Error::Capture(format!("{}: {}", iface, e)))?;

            cap.filter("arp", true)
                .map_err(|e| Error::Capture(format!("{}: bpf filter: {}", iface, e)))?;

            Ok(Self {
                name: format!("live:{}", iface),
                interface: Arc::from(iface.as_str()),
                cap: Some(cap),
                stats: CaptureStats::default(),
            })
        }
    }

    impl CaptureSource for LiveCapture {
        fn name(&self) -> &str {
            &self.name
        }

        fn next_frame(&mut self) -> Result<CaptureEvent> {
            let Some(cap) = self.cap.as_mut() else {
                return Ok(CaptureEvent::EndOfStream);
            };

            match cap.next_packet() {
                Ok(packet) => {
                    self.stats.received += 1;
                    let frame = RawFrame::new(packet.data.to_vec(), Utc::now(), self.interface.clone());
                    Ok(CaptureEvent::Frame(frame))
                }
                Err(pcap::Error::TimeoutExpired) => Ok(CaptureEvent::Timeout),
                Err(e) => Err(Error::Capture(e.to_string())),
            }
        }

        fn clock(&self) -> ClockMode {
            ClockMode::Wall
        }

        /// Kernel drop counters are only refreshed by `close()`
        fn stats(&self) -> CaptureStats {
            self.stats.clone()
        }

        fn close(&mut self) {
            if let Some(mut cap) = self.cap.take() {
                if let Ok(s) = cap.stats() {
                    self.stats.dropped = u64::from(s.dropped);
                    self.stats.if_dropped = u64::from(s.if_dropped);
                }
            }
        }
    }
}
