//! Concurrent binding table with idle expiry
//!
//! Sharded map: upserts for different IPs land on independent shard locks,
//! upsert and sweep for the same IP serialise on that IP's shard.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, trace};

use super::{Binding, UpsertResult};
use crate::core::event::MacAddr;
use crate::core::to_chrono;
use crate::error::TableError;

/// Number of shards (power of 2)
const NUM_SHARDS: usize = 32;

/// Table statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableStats {
    pub bindings: usize,
    pub created: u64,
    pub updated: u64,
    pub conflicts: u64,
    pub replaced: u64,
    pub expired: u64,
    pub removed: u64,
}

#[derive(Debug, Default)]
struct TableCounters {
    created: AtomicU64,
    updated: AtomicU64,
    conflicts: AtomicU64,
    replaced: AtomicU64,
    expired: AtomicU64,
    removed: AtomicU64,
}

/// In-memory IP -> MAC binding table
#[derive(Debug)]
pub struct BindingTable {
    bindings: DashMap<Ipv4Addr, Binding>,
    counters: TableCounters,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bindings: DashMap::with_capacity_and_shard_amount(capacity, NUM_SHARDS),
            counters: TableCounters::default(),
        }
    }

    /// Current binding for `ip`. Never mutates.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<Binding> {
        self.bindings.get(&ip).map(|b| b.clone())
    }

    /// Record an observation of `ip` at `mac`.
    ///
    /// A different bound MAC is reported as `Conflict(old)` and is not
    /// overwritten; use `replace` to adopt the new MAC.
    pub fn upsert(
        &self,
        ip: Ipv4Addr,
        mac: MacAddr,
        now: DateTime<Utc>,
    ) -> Result<UpsertResult, TableError> {
        match self.bindings.entry(ip) {
            Entry::Occupied(mut entry) => {
                let binding = entry.get_mut();
                check_entry(ip, binding)?;

                if binding.mac == mac {
                    // Workers may deliver slightly out of order
                    if now > binding.last_seen {
                        binding.last_seen = now;
                    }
                    binding.observation_count += 1;
                    self.counters.updated.fetch_add(1, Ordering::Relaxed);
                    trace!("binding {} -> {} refreshed", ip, mac);
                    Ok(UpsertResult::Updated)
                } else {
                    binding.conflict_count = binding.conflict_count.saturating_add(1);
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                    Ok(UpsertResult::Conflict(binding.mac))
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Binding::new(ip, mac, now));
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                debug!("new binding {} -> {}", ip, mac);
                Ok(UpsertResult::Created)
            }
        }
    }

    /// Overwrite the binding for `ip` with `mac`, returning the previous MAC.
    /// Refuses pinned bindings.
    pub fn replace(
        &self,
        ip: Ipv4Addr,
        mac: MacAddr,
        now: DateTime<Utc>,
    ) -> Result<Option<MacAddr>, TableError> {
        match self.bindings.entry(ip) {
            Entry::Occupied(mut entry) => {
                let binding = entry.get_mut();
                check_entry(ip, binding)?;
                if binding.pinned {
                    return Err(TableError::Pinned {
                        ip,
                        mac: binding.mac,
                    });
                }

                let old = binding.mac;
                let conflict_count = binding.conflict_count;
                *binding = Binding {
                    conflict_count,
                    ..Binding::new(ip, mac, now)
                };
                self.counters.replaced.fetch_add(1, Ordering::Relaxed);
                debug!("binding {} replaced: {} -> {}", ip, old, mac);
                Ok(Some(old))
            }
            Entry::Vacant(entry) => {
                entry.insert(Binding::new(ip, mac, now));
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Install a static binding. Replaces whatever was there.
    pub fn pin(&self, ip: Ipv4Addr, mac: MacAddr, now: DateTime<Utc>) {
        self.bindings.insert(ip, Binding::pinned(ip, mac, now));
    }

    /// Explicit reset of one binding. Pinned bindings are kept.
    pub fn remove(&self, ip: Ipv4Addr) -> Option<Binding> {
        let removed = self
            .bindings
            .remove_if(&ip, |_, binding| !binding.pinned)
            .map(|(_, binding)| binding);
        if removed.is_some() {
            self.counters.removed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every learned binding, keep pinned ones. Returns the number removed.
    pub fn clear(&self) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, binding| binding.pinned);
        let removed = before.saturating_sub(self.bindings.len());
        self.counters.removed.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Remove bindings idle for longer than `idle_interval`. Safe to run
    /// while other threads look up and upsert.
    pub fn sweep_expired(&self, now: DateTime<Utc>, idle_interval: Duration) -> usize {
        let idle = to_chrono(idle_interval);
        let mut removed = 0usize;

        self.bindings.retain(|_, binding| {
            let keep = binding.pinned || binding.idle_for(now) <= idle;
            if !keep {
                removed += 1;
                trace!("binding {} -> {} expired", binding.ip, binding.mac);
            }
            keep
        });

        if removed > 0 {
            self.counters.expired.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("expired {} idle bindings", removed);
        }
        removed
    }

    /// Check every stored binding against the table invariants
    pub fn verify(&self) -> Result<(), TableError> {
        for entry in self.bindings.iter() {
            check_entry(*entry.key(), entry.value())?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Copy of all bindings, in no particular order
    pub fn snapshot(&self) -> Vec<Binding> {
        self.bindings.iter().map(|b| b.value().clone()).collect()
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            bindings: self.bindings.len(),
            created: self.counters.created.load(Ordering::Relaxed),
            updated: self.counters.updated.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            replaced: self.counters.replaced.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            removed: self.counters.removed.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: Ipv4Addr, binding: Binding) {
        self.bindings.insert(key, binding);
    }
}

impl Default for BindingTable {
    fn default() -> Self {
        Self::new()
    }
}

fn check_entry(key: Ipv4Addr, binding: &Binding) -> Result<(), TableError> {
    if binding.ip != key {
        return Err(TableError::Inconsistent {
            ip: key,
            reason: format!("entry stores binding for {}", binding.ip),
        });
    }
    if binding.first_seen > binding.last_seen {
        return Err(TableError::Inconsistent {
            ip: key,
            reason: "first_seen is after last_seen".to_string(),
        });
    }
    Ok(())
}
