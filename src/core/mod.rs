//! Core shared types for ARP processing and detection
//!
//! - `event`: frames, decoded ARP events and alerts
//! - `parser`: Ethernet/ARP frame decoder

pub mod event;
pub mod parser;

pub use event::{Alert, AlertKind, ArpEvent, ArpOp, MacAddr, RawFrame, Severity};
pub use parser::{build_arp_frame, decode};

/// Convert a configured std duration to a chrono duration, saturating far in the future
pub(crate) fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
