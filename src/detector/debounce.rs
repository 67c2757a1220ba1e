//! Per-IP conflict debounce window
//!
//! A window opens on the first conflicting reply for an IP and tracks the
//! two MACs involved. Alternation between them inside the window collapses
//! into a single `Flapping` alert; a conflict that does not alternate enough
//! resolves into a single `MacConflict` once the window elapses. A reported
//! conflict may leave a `Confirmed` window behind that absorbs the same
//! contender until it goes quiet.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::event::{Alert, AlertKind, MacAddr, Severity};
use crate::core::to_chrono;

/// Debounce thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebounceConfig {
    /// Alternating replies within the window that mark the IP as flapping
    #[serde(default = "default_count")]
    pub count: u32,
    /// Window length (milliseconds)
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_count() -> u32 { 3 }
fn default_window_ms() -> u64 { 2000 }

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            count: default_count(),
            window_ms: default_window_ms(),
        }
    }
}

impl DebounceConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    /// Conflict seen, classification pending
    Pending,
    /// Flapping alert already emitted; further alternation suppressed
    Flapping,
    /// Alert emitted up front (pinned binding); window only suppresses repeats
    Reported,
    /// Conflict resolved and reported while the old MAC is held; repeats of
    /// the same contender are suppressed until it is idle
    Confirmed,
}

/// Result of feeding one reply into an open window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStep {
    Absorbed,
    /// Alternation threshold reached; emit a Flapping alert now
    BecameFlapping,
}

#[derive(Debug, Clone)]
pub struct ConflictWindow {
    pub ip: Ipv4Addr,
    /// MAC bound when the window opened
    pub bound_mac: MacAddr,
    /// MAC that triggered the conflict
    pub contender: MacAddr,
    pub opened_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Latest reply carrying `contender`
    pub contender_seen: DateTime<Utc>,
    pub phase: WindowPhase,
    /// Conflicting replies (carrying `contender`) seen so far
    pub evidence: u32,
    /// Alternations between the two MACs; the opening conflict is the first
    pub transitions: u32,
    last_mac: MacAddr,
    interface: Arc<str>,
}

impl ConflictWindow {
    pub fn open(
        ip: Ipv4Addr,
        bound_mac: MacAddr,
        contender: MacAddr,
        now: DateTime<Utc>,
        interface: Arc<str>,
    ) -> Self {
        Self {
            ip,
            bound_mac,
            contender,
            opened_at: now,
            last_activity: now,
            contender_seen: now,
            phase: WindowPhase::Pending,
            evidence: 1,
            transitions: 1,
            last_mac: contender,
            interface,
        }
    }

    pub fn reported(mut self) -> Self {
        self.phase = WindowPhase::Reported;
        self
    }

    pub fn confirmed(mut self) -> Self {
        self.phase = WindowPhase::Confirmed;
        self
    }

    /// Whether `(a, b)` is this window's MAC pair, in either order
    pub fn is_pair(&self, a: MacAddr, b: MacAddr) -> bool {
        (self.bound_mac == a && self.contender == b) || (self.bound_mac == b && self.contender == a)
    }

    pub fn involves(&self, mac: MacAddr) -> bool {
        mac == self.bound_mac || mac == self.contender
    }

    /// Feed a reply carrying one of the pair's MACs
    pub fn observe(&mut self, mac: MacAddr, now: DateTime<Utc>, config: &DebounceConfig) -> WindowStep {
        if !self.involves(mac) {
            return WindowStep::Absorbed;
        }
        if mac == self.contender {
            self.evidence = self.evidence.saturating_add(1);
            if now > self.contender_seen {
                self.contender_seen = now;
            }
        }
        if mac == self.last_mac {
            return WindowStep::Absorbed;
        }

        self.last_mac = mac;
        self.transitions = self.transitions.saturating_add(1);
        if now > self.last_activity {
            self.last_activity = now;
        }

        // Alternating events = transitions + the reply before the first one
        if self.phase == WindowPhase::Pending && self.transitions + 1 >= config.count {
            self.phase = WindowPhase::Flapping;
            return WindowStep::BecameFlapping;
        }
        WindowStep::Absorbed
    }

    /// Pending windows close a full window after opening, flapping windows
    /// roll with alternation, reported and confirmed windows with the
    /// contender's replies.
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let window = to_chrono(window);
        let anchor = match self.phase {
            WindowPhase::Pending => self.opened_at,
            WindowPhase::Flapping => self.last_activity,
            WindowPhase::Reported | WindowPhase::Confirmed => self.contender_seen,
        };
        now.signed_duration_since(anchor) >= window
    }

    /// Alert owed when the window closes, if any
    pub fn resolve(self) -> Option<Alert> {
        match self.phase {
            WindowPhase::Pending => Some(
                Alert::new(
                    AlertKind::MacConflict,
                    self.ip,
                    Some(self.bound_mac),
                    self.contender,
                    self.opened_at,
                )
                .with_evidence(self.evidence)
                .with_interface(&self.interface),
            ),
            WindowPhase::Flapping | WindowPhase::Reported | WindowPhase::Confirmed => None,
        }
    }

    pub fn flapping_alert(&self, now: DateTime<Utc>) -> Alert {
        Alert::new(
            AlertKind::Flapping,
            self.ip,
            Some(self.bound_mac),
            self.contender,
            now,
        )
        .with_severity(Severity::Low)
        .with_evidence(self.transitions + 1)
        .with_interface(&self.interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a() -> MacAddr {
        MacAddr([0xaa; 6])
    }

    fn b() -> MacAddr {
        MacAddr([0xbb; 6])
    }

    fn window(now: DateTime<Utc>) -> ConflictWindow {
        ConflictWindow::open(Ipv4Addr::new(10, 0, 0, 5), a(), b(), now, Arc::from("eth0"))
    }

    #[test]
    fn test_alternation_becomes_flapping_once() {
        let config = DebounceConfig::default();
        let t0 = Utc::now();
        let mut w = window(t0);

        let step = w.observe(a(), t0 + chrono::Duration::milliseconds(100), &config);
        assert_eq!(step, WindowStep::BecameFlapping);

        let step = w.observe(b(), t0 + chrono::Duration::milliseconds(200), &config);
        assert_eq!(step, WindowStep::Absorbed);
        assert_eq!(w.phase, WindowPhase::Flapping);
        assert!(w.clone().resolve().is_none());
    }

    #[test]
    fn test_repeated_contender_is_not_alternation() {
        let config = DebounceConfig::default();
        let t0 = Utc::now();
        let mut w = window(t0);

        for i in 1..5 {
            let step = w.observe(b(), t0 + chrono::Duration::milliseconds(i * 10), &config);
            assert_eq!(step, WindowStep::Absorbed);
        }
        assert_eq!(w.phase, WindowPhase::Pending);

        let alert = w.resolve().unwrap();
        assert_eq!(alert.kind, AlertKind::MacConflict);
        assert_eq!(alert.old_mac, Some(a()));
        assert_eq!(alert.new_mac, b());
        assert_eq!(alert.evidence_count, 5);
    }

    #[test]
    fn test_pending_expires_from_open_time() {
        let t0 = Utc::now();
        let w = window(t0);
        let span = Duration::from_secs(2);

        assert!(!w.is_expired(t0 + chrono::Duration::milliseconds(1999), span));
        assert!(w.is_expired(t0 + chrono::Duration::milliseconds(2000), span));
    }

    #[test]
    fn test_flapping_window_rolls_with_activity() {
        let config = DebounceConfig::default();
        let span = config.window();
        let t0 = Utc::now();
        let mut w = window(t0);

        w.observe(a(), t0 + chrono::Duration::milliseconds(1500), &config);
        w.observe(b(), t0 + chrono::Duration::milliseconds(3000), &config);
        assert!(!w.is_expired(t0 + chrono::Duration::milliseconds(4000), span));
        assert!(w.is_expired(t0 + chrono::Duration::milliseconds(5000), span));
    }

    #[test]
    fn test_confirmed_window_expires_on_contender_silence() {
        let config = DebounceConfig::default();
        let span = Duration::from_secs(10);
        let t0 = Utc::now();
        let mut w = window(t0).confirmed();

        w.observe(b(), t0 + chrono::Duration::milliseconds(500), &config);
        // The bound host keeps talking; that does not extend the window
        w.observe(a(), t0 + chrono::Duration::milliseconds(5000), &config);

        assert_eq!(w.phase, WindowPhase::Confirmed);
        assert!(!w.is_expired(t0 + chrono::Duration::milliseconds(10_499), span));
        assert!(w.is_expired(t0 + chrono::Duration::milliseconds(10_500), span));
        assert!(w.resolve().is_none());
    }

    #[test]
    fn test_pair_matching_is_unordered() {
        let w = window(Utc::now());
        assert!(w.is_pair(a(), b()));
        assert!(w.is_pair(b(), a()));
        assert!(!w.is_pair(a(), MacAddr([0xcc; 6])));
    }
}
