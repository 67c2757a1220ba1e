//! ARP events and alerts
//!
//! Shared types handed between the decoder, the detector and the alert sinks.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// 48-bit link-layer address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        MacAddr([a, b, c, d, e, f])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit set (includes broadcast)
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid MAC address: {0}")]
pub struct ParseMacError(String);

impl FromStr for MacAddr {
    type Err = ParseMacError;

    /// Accepts `aa:bb:cc:dd:ee:ff` and `aa-bb-cc-dd-ee-ff`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(ParseMacError(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(ParseMacError(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        Ok(MacAddr(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// ARP operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArpOp {
    Request,
    Reply,
}

/// Raw link-layer frame as delivered by a capture source
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub interface: Arc<str>,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, timestamp: DateTime<Utc>, interface: Arc<str>) -> Self {
        Self {
            data,
            timestamp,
            interface,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Decoded ARP observation. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpEvent {
    pub operation: ArpOp,
    pub sender_ip: Ipv4Addr,
    pub sender_mac: MacAddr,
    pub target_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub received_at: DateTime<Utc>,
    pub interface: Arc<str>,
}

impl ArpEvent {
    /// Sender announces its own address (sender IP == target IP)
    pub fn is_gratuitous(&self) -> bool {
        self.sender_ip == self.target_ip
    }

    /// Address conflict check (RFC 5227): request with an unspecified sender address
    pub fn is_address_check(&self) -> bool {
        self.operation == ArpOp::Request && self.sender_ip.is_unspecified()
    }
}

/// Detection severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Severity {
    Info = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Medium
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Alert categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// First sight of an IP (only when enabled)
    NewBinding,
    /// IP claimed by a different MAC
    MacConflict,
    /// IP alternating between two MACs inside the debounce window
    Flapping,
}

impl AlertKind {
    pub fn default_severity(&self) -> Severity {
        match self {
            AlertKind::NewBinding => Severity::Info,
            AlertKind::Flapping => Severity::Low,
            AlertKind::MacConflict => Severity::High,
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::NewBinding => write!(f, "new_binding"),
            AlertKind::MacConflict => write!(f, "mac_conflict"),
            AlertKind::Flapping => write!(f, "flapping"),
        }
    }
}

/// Detector output. Never mutated once handed to a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub ip: Ipv4Addr,
    pub old_mac: Option<MacAddr>,
    pub new_mac: MacAddr,
    pub timestamp: DateTime<Utc>,
    /// Observations backing this alert
    pub evidence_count: u32,
    pub interface: String,
    pub message: String,
}

impl Alert {
    pub fn new(
        kind: AlertKind,
        ip: Ipv4Addr,
        old_mac: Option<MacAddr>,
        new_mac: MacAddr,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let message = match (kind, old_mac) {
            (AlertKind::NewBinding, _) | (_, None) => format!("{} is at {}", ip, new_mac),
            (AlertKind::MacConflict, Some(old)) => {
                format!("{} changed MAC from {} to {}", ip, old, new_mac)
            }
            (AlertKind::Flapping, Some(old)) => {
                format!("{} flapping between {} and {}", ip, old, new_mac)
            }
        };

        Self {
            kind,
            severity: kind.default_severity(),
            ip,
            old_mac,
            new_mac,
            timestamp,
            evidence_count: 1,
            interface: String::new(),
            message,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_evidence(mut self, count: u32) -> Self {
        self.evidence_count = count;
        self
    }

    pub fn with_interface(mut self, interface: &str) -> Self {
        self.interface = interface.to_string();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} (evidence={})",
            self.severity, self.kind, self.message, self.evidence_count
        )
    }
}
