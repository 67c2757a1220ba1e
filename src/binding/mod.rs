//! IP -> MAC bindings
//!
//! One `Binding` per IPv4 address, owned by the `BindingTable`. The detector
//! is the only writer; everything else reads snapshots.

pub mod table;

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::event::MacAddr;

pub use table::{BindingTable, TableStats};

/// Authoritative IP -> MAC association
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub observation_count: u64,
    /// Conflicting replies seen while this MAC was bound
    pub conflict_count: u32,
    /// Static binding from configuration: never expires, never replaced
    pub pinned: bool,
}

impl Binding {
    pub fn new(ip: Ipv4Addr, mac: MacAddr, now: DateTime<Utc>) -> Self {
        Self {
            ip,
            mac,
            first_seen: now,
            last_seen: now,
            observation_count: 1,
            conflict_count: 0,
            pinned: false,
        }
    }

    pub fn pinned(ip: Ipv4Addr, mac: MacAddr, now: DateTime<Utc>) -> Self {
        Self {
            pinned: true,
            ..Self::new(ip, mac, now)
        }
    }

    /// Time since last observation
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_seen)
    }
}

/// Outcome of `BindingTable::upsert`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    /// No binding existed; one was created
    Created,
    /// Same MAC re-observed
    Updated,
    /// A different MAC is bound; the table was left unchanged apart from
    /// the conflict counter
    Conflict(MacAddr),
}
