//! Engine counters and snapshots

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::binding::TableStats;
use crate::detector::DetectorStats;
use crate::output::DispatchStats;

/// Pipeline counters shared by the capture thread and workers
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub frames_captured: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_malformed: AtomicU64,
    pub frames_unsupported: AtomicU64,
    pub events_processed: AtomicU64,
    pub alerts_emitted: AtomicU64,
    pub capture_errors: AtomicU64,
}

impl EngineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed)
    }
}

/// Serialisable snapshot of everything the engine counts
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub frames_captured: u64,
    /// Frames lost because the frame queue was full
    pub frames_dropped: u64,
    pub frames_malformed: u64,
    pub frames_unsupported: u64,
    pub capture_errors: u64,
    pub events_processed: u64,
    pub replies: u64,
    pub requests: u64,
    pub gratuitous: u64,
    pub address_checks: u64,
    pub invalid_senders: u64,
    pub bindings: usize,
    pub bindings_created: u64,
    pub bindings_expired: u64,
    pub conflicts: u64,
    pub open_windows: usize,
    /// MACs answering for more than one IP
    pub macs_with_multiple_ips: usize,
    pub alerts_emitted: u64,
    pub alerts_delivered: u64,
    pub alerts_dropped: u64,
    pub sink_errors: u64,
}

impl EngineStats {
    pub fn collect(
        counters: &EngineCounters,
        detector: &DetectorStats,
        table: &TableStats,
        alerts: Option<&DispatchStats>,
    ) -> Self {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let alerts = alerts.cloned().unwrap_or_default();

        Self {
            frames_captured: load(&counters.frames_captured),
            frames_dropped: load(&counters.frames_dropped),
            frames_malformed: load(&counters.frames_malformed),
            frames_unsupported: load(&counters.frames_unsupported),
            capture_errors: load(&counters.capture_errors),
            events_processed: load(&counters.events_processed),
            replies: detector.replies,
            requests: detector.requests,
            gratuitous: detector.gratuitous,
            address_checks: detector.address_checks,
            invalid_senders: detector.invalid_senders,
            bindings: table.bindings,
            bindings_created: table.created,
            bindings_expired: table.expired,
            conflicts: table.conflicts,
            open_windows: detector.open_windows,
            macs_with_multiple_ips: detector.macs_with_multiple_ips,
            alerts_emitted: load(&counters.alerts_emitted),
            alerts_delivered: alerts.delivered,
            alerts_dropped: alerts.dropped,
            sink_errors: alerts.sink_errors,
        }
    }

    /// Frames read from the source that were neither decoded nor dropped
    /// are still in flight.
    pub fn frames_accounted(&self) -> u64 {
        self.frames_dropped + self.frames_malformed + self.frames_unsupported + self.events_processed
    }

    /// Any conflicting reply or MAC answering for several IPs was seen
    pub fn spoofing_suspected(&self) -> bool {
        self.conflicts > 0 || self.macs_with_multiple_ips > 0
    }
}
