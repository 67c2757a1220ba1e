//! MAC -> claimed IPs index
//!
//! Every valid reply records which IP its sender MAC answered for. A MAC
//! answering for several IPs is how a spoofer looks from the outside: it keeps
//! its own address and also claims the victim's. Proxy ARP does the same
//! legitimately, so the index is reported rather than alerted on.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::core::event::MacAddr;
use crate::core::to_chrono;

/// A MAC seen answering for more than one IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateMac {
    pub mac: MacAddr,
    pub ips: Vec<Ipv4Addr>,
}

/// Claimed IPs per MAC, each with the time it was last claimed
#[derive(Debug, Default)]
pub struct MacClaims {
    claims: DashMap<MacAddr, BTreeMap<Ipv4Addr, DateTime<Utc>>>,
}

impl MacClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `mac` answered for `ip`. When this adds a second (or
    /// further) IP for the MAC, returns every IP it now claims.
    pub fn record(&self, mac: MacAddr, ip: Ipv4Addr, now: DateTime<Utc>) -> Option<Vec<Ipv4Addr>> {
        let mut ips = self.claims.entry(mac).or_default();
        let added = match ips.get_mut(&ip) {
            Some(seen) => {
                if now > *seen {
                    *seen = now;
                }
                false
            }
            None => {
                ips.insert(ip, now);
                true
            }
        };

        if added && ips.len() > 1 {
            Some(ips.keys().copied().collect())
        } else {
            None
        }
    }

    pub fn ips_for(&self, mac: MacAddr) -> Vec<Ipv4Addr> {
        self.claims
            .get(&mac)
            .map(|ips| ips.keys().copied().collect())
            .unwrap_or_default()
    }

    /// MACs claiming several IPs, ordered by MAC
    pub fn duplicates(&self) -> Vec<DuplicateMac> {
        let mut duplicates: Vec<DuplicateMac> = self
            .claims
            .iter()
            .filter(|entry| entry.value().len() > 1)
            .map(|entry| DuplicateMac {
                mac: *entry.key(),
                ips: entry.value().keys().copied().collect(),
            })
            .collect();
        duplicates.sort_by_key(|d| d.mac);
        duplicates
    }

    pub fn macs_with_multiple_ips(&self) -> usize {
        self.claims.iter().filter(|entry| entry.value().len() > 1).count()
    }

    /// Drop claims not renewed within `idle`. Returns the number of claims removed.
    pub fn sweep(&self, now: DateTime<Utc>, idle: Duration) -> usize {
        let idle = to_chrono(idle);
        let mut removed = 0usize;

        self.claims.retain(|_, ips| {
            let before = ips.len();
            ips.retain(|_, seen| now.signed_duration_since(*seen) <= idle);
            removed += before - ips.len();
            !ips.is_empty()
        });
        removed
    }

    /// Forget every claim on `ip`
    pub fn forget_ip(&self, ip: Ipv4Addr) {
        self.claims.retain(|_, ips| {
            ips.remove(&ip);
            !ips.is_empty()
        });
    }

    pub fn clear(&self) {
        self.claims.clear();
    }

    /// Number of MACs tracked
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}
