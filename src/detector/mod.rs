//! ARP spoofing detector
//!
//! Consumes decoded ARP events, maintains the binding table and classifies
//! each reply as benign, new binding, conflict or flapping.
//!
//! Per IP the logical state is `Unknown -> Bound`; a reply with another MAC
//! is classified `Suspect` and opens a debounce window (see `debounce`).
//! The table itself only ever holds bound entries.
//!
//! Alongside the table, `claims` indexes which IPs each MAC has answered
//! for, so one MAC claiming several addresses shows up in the stats.

pub mod claims;
pub mod debounce;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::binding::{Binding, BindingTable, UpsertResult};
use crate::core::event::{Alert, AlertKind, ArpEvent, ArpOp, MacAddr, Severity};
use crate::error::TableError;

pub use claims::{DuplicateMac, MacClaims};
pub use debounce::{ConflictWindow, DebounceConfig, WindowPhase, WindowStep};

/// What to do with the binding when a conflict is first seen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Keep the old MAC until the binding is reset
    HoldOldMac,
    /// Overwrite the binding with the new MAC
    AdoptNewMac,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::HoldOldMac
    }
}

/// Detector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Bindings idle longer than this are expired (seconds)
    #[serde(default = "default_idle_interval_secs")]
    pub idle_interval_secs: u64,
    /// Emit NewBinding alerts on first sight of an IP
    #[serde(default)]
    pub alert_on_first_sight: bool,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub conflict_debounce: DebounceConfig,
    /// Pinned IP -> MAC bindings (gateways, servers)
    #[serde(default)]
    pub static_bindings: BTreeMap<Ipv4Addr, MacAddr>,
}

fn default_idle_interval_secs() -> u64 { 300 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            idle_interval_secs: default_idle_interval_secs(),
            alert_on_first_sight: false,
            conflict_policy: ConflictPolicy::default(),
            conflict_debounce: DebounceConfig::default(),
            static_bindings: BTreeMap::new(),
        }
    }
}

impl DetectorConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }
}

/// Detector statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectorStats {
    pub replies: u64,
    pub requests: u64,
    pub gratuitous: u64,
    /// Requests with an unspecified sender (address conflict detection)
    pub address_checks: u64,
    pub invalid_senders: u64,
    pub conflicts_opened: u64,
    pub new_binding_alerts: u64,
    pub mac_conflict_alerts: u64,
    pub flapping_alerts: u64,
    pub open_windows: usize,
    pub macs_with_multiple_ips: usize,
}

#[derive(Debug, Default)]
struct DetectorCounters {
    replies: AtomicU64,
    requests: AtomicU64,
    gratuitous: AtomicU64,
    address_checks: AtomicU64,
    invalid_senders: AtomicU64,
    conflicts_opened: AtomicU64,
    new_binding_alerts: AtomicU64,
    mac_conflict_alerts: AtomicU64,
    flapping_alerts: AtomicU64,
}

/// Per-IP detector state. Holding its map entry serialises classification
/// for that IP.
#[derive(Debug, Default)]
struct IpState {
    window: Option<ConflictWindow>,
}

/// Stateful ARP spoofing detector. Shareable across worker threads.
pub struct Detector {
    config: DetectorConfig,
    table: Arc<BindingTable>,
    states: DashMap<Ipv4Addr, IpState>,
    claims: MacClaims,
    /// Latest event time seen, the clock for replayed traffic
    watermark: Mutex<Option<DateTime<Utc>>>,
    counters: DetectorCounters,
}

impl Detector {
    pub fn new(config: DetectorConfig) -> Self {
        Self::with_table(config, Arc::new(BindingTable::new()))
    }

    pub fn with_table(config: DetectorConfig, table: Arc<BindingTable>) -> Self {
        let now = Utc::now();
        for (ip, mac) in &config.static_bindings {
            table.pin(*ip, *mac, now);
        }
        if !config.static_bindings.is_empty() {
            info!("pinned {} static bindings", config.static_bindings.len());
        }

        Self {
            config,
            table,
            states: DashMap::new(),
            claims: MacClaims::new(),
            watermark: Mutex::new(None),
            counters: DetectorCounters::default(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<BindingTable> {
        &self.table
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<Binding> {
        self.table.lookup(ip)
    }

    /// IPs `mac` has answered for and not yet been swept
    pub fn claimed_ips(&self, mac: MacAddr) -> Vec<Ipv4Addr> {
        self.claims.ips_for(mac)
    }

    /// MACs currently answering for more than one IP
    pub fn duplicate_macs(&self) -> Vec<DuplicateMac> {
        self.claims.duplicates()
    }

    /// Latest event timestamp processed so far
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        *self.watermark.lock()
    }

    /// Classify one event. Returns the alerts it produced, possibly none.
    ///
    /// An `Err` means the binding table broke an invariant; the caller must
    /// escalate, it is never a network condition.
    pub fn process(&self, event: &ArpEvent) -> Result<Vec<Alert>, TableError> {
        self.advance_watermark(event.received_at);

        if event.is_gratuitous() {
            self.counters.gratuitous.fetch_add(1, Ordering::Relaxed);
        }

        // Requests are observed only; the binding comes from the reply
        if event.operation == ArpOp::Request {
            self.counters.requests.fetch_add(1, Ordering::Relaxed);
            if event.is_address_check() {
                self.counters.address_checks.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(Vec::new());
        }
        self.counters.replies.fetch_add(1, Ordering::Relaxed);

        if !is_valid_sender(event) {
            self.counters.invalid_senders.fetch_add(1, Ordering::Relaxed);
            debug!(
                "ignoring reply with invalid sender {} / {}",
                event.sender_ip, event.sender_mac
            );
            return Ok(Vec::new());
        }

        let ip = event.sender_ip;
        let mac = event.sender_mac;
        let now = event.received_at;
        let mut alerts = Vec::new();

        {
            let mut state = self.states.entry(ip).or_default();

            let expired = state
                .window
                .as_ref()
                .map_or(false, |w| w.is_expired(now, self.window_span(w)));
            if expired {
                self.expire_window(&mut state, &mut alerts);
            }

            if let Some(pinned) = self.config.static_bindings.get(&ip).copied() {
                self.classify_pinned(&mut state, event, pinned, &mut alerts)?;
            } else {
                self.classify(&mut state, event, &mut alerts)?;
            }
        }

        self.states.remove_if(&ip, |_, state| state.window.is_none());

        if let Some(ips) = self.claims.record(mac, ip, now) {
            warn!(
                "{} answers for {} addresses: {}",
                mac,
                ips.len(),
                ips.iter().map(|ip| ip.to_string()).collect::<Vec<_>>().join(", ")
            );
        }

        for alert in &alerts {
            debug!("{}", alert);
        }
        Ok(alerts)
    }

    fn classify(
        &self,
        state: &mut IpState,
        event: &ArpEvent,
        alerts: &mut Vec<Alert>,
    ) -> Result<(), TableError> {
        let (ip, mac, now) = (event.sender_ip, event.sender_mac, event.received_at);
        let debounce = &self.config.conflict_debounce;

        match self.table.upsert(ip, mac, now)? {
            UpsertResult::Created => {
                // Fresh binding: anything left over belongs to a swept entry
                if let Some(window) = state.window.take() {
                    self.push_resolved(window, alerts);
                }
                if self.config.alert_on_first_sight {
                    self.counters.new_binding_alerts.fetch_add(1, Ordering::Relaxed);
                    alerts.push(
                        Alert::new(AlertKind::NewBinding, ip, None, mac, now)
                            .with_interface(&event.interface),
                    );
                }
            }
            UpsertResult::Updated => {
                if let Some(window) = state.window.as_mut() {
                    if window.observe(mac, now, debounce) == WindowStep::BecameFlapping {
                        self.push_flapping(window, now, alerts);
                    }
                }
            }
            UpsertResult::Conflict(old) => {
                let same_pair = state.window.as_ref().map_or(false, |w| w.is_pair(old, mac));
                if same_pair {
                    if let Some(window) = state.window.as_mut() {
                        if window.observe(mac, now, debounce) == WindowStep::BecameFlapping {
                            self.push_flapping(window, now, alerts);
                        }
                    }
                } else {
                    // A third MAC closes the current window before opening a new one
                    if let Some(window) = state.window.take() {
                        self.push_resolved(window, alerts);
                    }
                    self.open_window(state, event, old)?;
                }
            }
        }
        Ok(())
    }

    fn open_window(
        &self,
        state: &mut IpState,
        event: &ArpEvent,
        old: MacAddr,
    ) -> Result<(), TableError> {
        let (ip, mac, now) = (event.sender_ip, event.sender_mac, event.received_at);
        self.counters.conflicts_opened.fetch_add(1, Ordering::Relaxed);
        warn!("{} claimed by {} while bound to {}", ip, mac, old);

        if self.config.conflict_policy == ConflictPolicy::AdoptNewMac {
            self.table.replace(ip, mac, now)?;
        }
        state.window = Some(ConflictWindow::open(ip, old, mac, now, event.interface.clone()));
        Ok(())
    }

    /// Pinned IPs alert immediately at critical severity; the window only
    /// suppresses repeats.
    fn classify_pinned(
        &self,
        state: &mut IpState,
        event: &ArpEvent,
        pinned: MacAddr,
        alerts: &mut Vec<Alert>,
    ) -> Result<(), TableError> {
        let (ip, mac, now) = (event.sender_ip, event.sender_mac, event.received_at);

        if mac == pinned {
            self.table.upsert(ip, mac, now)?;
            return Ok(());
        }

        if !self.table.lookup(ip).map_or(false, |b| b.pinned) {
            // Reset or swept by an operator; restore the pin
            self.table.pin(ip, pinned, now);
        }
        self.table.upsert(ip, mac, now)?;

        let repeat = state
            .window
            .as_ref()
            .map_or(false, |w| w.contender == mac && w.phase == WindowPhase::Reported);
        if let Some(window) = state.window.as_mut().filter(|_| repeat) {
            window.observe(mac, now, &self.config.conflict_debounce);
            return Ok(());
        }

        self.counters.conflicts_opened.fetch_add(1, Ordering::Relaxed);
        self.counters.mac_conflict_alerts.fetch_add(1, Ordering::Relaxed);
        warn!("{} is pinned to {} but claimed by {}", ip, pinned, mac);
        alerts.push(
            Alert::new(AlertKind::MacConflict, ip, Some(pinned), mac, now)
                .with_severity(Severity::Critical)
                .with_interface(&event.interface)
                .with_message(format!(
                    "{} is statically bound to {} but claimed by {}",
                    ip, pinned, mac
                )),
        );
        state.window =
            Some(ConflictWindow::open(ip, pinned, mac, now, event.interface.clone()).reported());
        Ok(())
    }

    /// Confirmed windows live as long as the contender keeps replying within
    /// the idle interval; the others span one debounce window.
    fn window_span(&self, window: &ConflictWindow) -> Duration {
        match window.phase {
            WindowPhase::Confirmed => self.config.idle_interval(),
            _ => self.config.conflict_debounce.window(),
        }
    }

    /// Close an elapsed window. A pending conflict on a held binding stays
    /// behind as `Confirmed` so the same contender is not reported again.
    fn expire_window(&self, state: &mut IpState, alerts: &mut Vec<Alert>) {
        if let Some(window) = state.window.take() {
            if window.phase == WindowPhase::Pending
                && self.config.conflict_policy == ConflictPolicy::HoldOldMac
            {
                state.window = Some(window.clone().confirmed());
            }
            self.push_resolved(window, alerts);
        }
    }

    fn push_resolved(&self, window: ConflictWindow, alerts: &mut Vec<Alert>) {
        if let Some(alert) = window.resolve() {
            self.counters.mac_conflict_alerts.fetch_add(1, Ordering::Relaxed);
            alerts.push(alert);
        }
    }

    fn push_flapping(&self, window: &ConflictWindow, now: DateTime<Utc>, alerts: &mut Vec<Alert>) {
        self.counters.flapping_alerts.fetch_add(1, Ordering::Relaxed);
        info!(
            "{} flapping between {} and {}",
            window.ip, window.bound_mac, window.contender
        );
        alerts.push(window.flapping_alert(now));
    }

    /// Close debounce windows that have elapsed at `now`
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let mut alerts = Vec::new();

        self.states.retain(|_, state| {
            let expired = state
                .window
                .as_ref()
                .map_or(true, |w| w.is_expired(now, self.window_span(w)));
            if expired {
                self.expire_window(state, &mut alerts);
            }
            state.window.is_some()
        });
        alerts
    }

    /// Close every open window regardless of age (shutdown)
    pub fn drain(&self) -> Vec<Alert> {
        let mut alerts = Vec::new();
        self.states.retain(|_, state| {
            if let Some(window) = state.window.take() {
                self.push_resolved(window, &mut alerts);
            }
            false
        });
        alerts
    }

    /// Expire idle bindings and re-check table invariants
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize, TableError> {
        let removed = self.table.sweep_expired(now, self.config.idle_interval());
        self.claims.sweep(now, self.config.idle_interval());
        self.table.verify()?;
        Ok(removed)
    }

    /// Forget one IP: its binding (unless pinned) and any open window
    pub fn reset(&self, ip: Ipv4Addr) -> bool {
        let had_window = self.states.remove(&ip).is_some();
        let had_binding = self.table.remove(ip).is_some();
        self.claims.forget_ip(ip);
        if had_window || had_binding {
            info!("binding for {} reset", ip);
        }
        had_window || had_binding
    }

    /// Forget all learned bindings and windows. Returns bindings removed.
    pub fn reset_all(&self) -> usize {
        self.states.clear();
        self.claims.clear();
        self.table.clear()
    }

    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            replies: self.counters.replies.load(Ordering::Relaxed),
            requests: self.counters.requests.load(Ordering::Relaxed),
            gratuitous: self.counters.gratuitous.load(Ordering::Relaxed),
            address_checks: self.counters.address_checks.load(Ordering::Relaxed),
            invalid_senders: self.counters.invalid_senders.load(Ordering::Relaxed),
            conflicts_opened: self.counters.conflicts_opened.load(Ordering::Relaxed),
            new_binding_alerts: self.counters.new_binding_alerts.load(Ordering::Relaxed),
            mac_conflict_alerts: self.counters.mac_conflict_alerts.load(Ordering::Relaxed),
            flapping_alerts: self.counters.flapping_alerts.load(Ordering::Relaxed),
            open_windows: self.states.len(),
            macs_with_multiple_ips: self.claims.macs_with_multiple_ips(),
        }
    }

    fn advance_watermark(&self, at: DateTime<Utc>) {
        let mut watermark = self.watermark.lock();
        if watermark.map_or(true, |w| at > w) {
            *watermark = Some(at);
        }
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

/// Zero, broadcast and multicast MACs or an unspecified IP never carry a binding
fn is_valid_sender(event: &ArpEvent) -> bool {
    let mac = event.sender_mac;
    !(mac.is_zero() || mac.is_multicast() || event.sender_ip.is_unspecified())
}
