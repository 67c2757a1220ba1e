//! Full pipeline scenarios: capture source -> engine -> sink

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use arpsentry::engine::{CaptureEvent, CaptureStats, ClockMode, MemorySource};
use arpsentry::output::ChannelSink;
use arpsentry::{
    Alert, AlertKind, AlertSink, AlertsConfig, ArpEngine, CaptureSource, Config, DetectorConfig,
    EngineConfig, EngineState, RawFrame, SinkError,
};

use common::*;

fn ms(t0: DateTime<Utc>, offset: i64) -> DateTime<Utc> {
    t0 + chrono::Duration::milliseconds(offset)
}

async fn run(source: MemorySource) -> (arpsentry::EngineStats, Vec<Alert>) {
    let (sink, rx) = ChannelSink::new(1024);
    let mut engine = ArpEngine::default();
    let stats = engine.run(Box::new(source), Arc::new(sink)).await.unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);
    (stats, collect(rx))
}

fn collect(mut rx: mpsc::Receiver<Alert>) -> Vec<Alert> {
    let mut alerts = Vec::new();
    while let Ok(alert) = rx.try_recv() {
        alerts.push(alert);
    }
    alerts
}

#[tokio::test]
async fn single_conflict_emits_one_mac_conflict() {
    let t0 = Utc::now();
    let mut source = MemorySource::new("eth0");
    source.push(reply(ip5(), AA), t0);
    source.push(reply(ip5(), BB), ms(t0, 800));

    let (stats, alerts) = run(source).await;

    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.kind, AlertKind::MacConflict);
    assert_eq!(alert.ip, ip5());
    assert_eq!(alert.old_mac, Some(AA));
    assert_eq!(alert.new_mac, BB);
    assert_eq!(alert.interface, "eth0");
    assert_eq!(stats.alerts_delivered, 1);
}

#[tokio::test]
async fn alternation_inside_window_is_flapping() {
    let t0 = Utc::now();
    let mut source = MemorySource::new("eth0");
    source.push(reply(ip5(), AA), t0);
    source.push(reply(ip5(), BB), ms(t0, 300));
    source.push(reply(ip5(), AA), ms(t0, 600));

    let (_, alerts) = run(source).await;

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::Flapping);
    assert!(alerts.iter().all(|a| a.kind != AlertKind::MacConflict));
}

#[tokio::test]
async fn rapid_alternation_never_alerts_per_event() {
    let t0 = Utc::now();
    let mut source = MemorySource::new("eth0");
    source.push(reply(ip5(), AA), t0);
    for i in 1..=40 {
        let mac = if i % 2 == 0 { AA } else { BB };
        source.push(reply(ip5(), mac), ms(t0, i * 40));
    }

    let (_, alerts) = run(source).await;

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::Flapping);
}

#[tokio::test]
async fn persistent_spoofer_is_reported_once() {
    let t0 = Utc::now();
    let mut source = MemorySource::new("eth0");
    source.push(reply(ip5(), AA), t0);
    // Spoofer keeps answering for a minute, far past the debounce window
    for i in 1..=120 {
        source.push(reply(ip5(), BB), ms(t0, i * 500));
    }

    let (stats, alerts) = run(source).await;

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::MacConflict);
    assert_eq!(alerts[0].new_mac, BB);
    assert_eq!(stats.conflicts, 120);
}

#[tokio::test]
async fn mac_claiming_gateway_and_own_address_is_summarised() {
    let t0 = Utc::now();
    let gateway = std::net::Ipv4Addr::new(10, 0, 0, 1);
    let mut source = MemorySource::new("eth0");
    source.push(reply(gateway, GATEWAY_MAC), t0);
    source.push(reply(ip5(), BB), ms(t0, 10));
    source.push(request(std::net::Ipv4Addr::UNSPECIFIED, AA, host_ip(9)), ms(t0, 20));
    source.push(reply(gateway, BB), ms(t0, 100));

    let (stats, alerts) = run(source).await;

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].ip, gateway);
    assert_eq!(stats.macs_with_multiple_ips, 1);
    assert_eq!(stats.address_checks, 1);
    assert!(stats.spoofing_suspected());
}

#[tokio::test]
async fn adopted_mac_conflicts_again_when_original_returns() {
    let t0 = Utc::now();
    let mut source = MemorySource::new("eth0");
    source.push(reply(ip5(), AA), t0);
    source.push(reply(ip5(), BB), ms(t0, 100));
    source.push(reply(ip5(), AA), ms(t0, 5_000));

    let detector = DetectorConfig {
        conflict_policy: arpsentry::ConflictPolicy::AdoptNewMac,
        ..Default::default()
    };
    let (sink, rx) = ChannelSink::new(16);
    let mut engine = ArpEngine::new(EngineConfig::default(), detector, AlertsConfig::default());
    engine.run(Box::new(source), Arc::new(sink)).await.unwrap();

    let alerts = collect(rx);
    assert_eq!(alerts.len(), 2);
    assert!(alerts.iter().all(|a| a.kind == AlertKind::MacConflict));
    assert_eq!(alerts[1].old_mac, Some(BB));
    assert_eq!(alerts[1].new_mac, AA);
}

#[tokio::test]
async fn truncated_frame_counted_once() {
    let mut source = MemorySource::new("eth0");
    source.push(vec![0u8; 10], Utc::now());

    let (stats, alerts) = run(source).await;

    assert_eq!(stats.frames_captured, 1);
    assert_eq!(stats.frames_malformed, 1);
    assert_eq!(stats.events_processed, 0);
    assert!(alerts.is_empty());
}

#[tokio::test]
async fn stable_traffic_is_silent() {
    let t0 = Utc::now();
    let mut source = MemorySource::new("eth0");
    for round in 0..20 {
        for host in 0..10u16 {
            source.push(reply(host_ip(host), host_mac(host)), ms(t0, round * 100 + host as i64));
        }
        // Requests never create or disturb bindings
        source.push(request(host_ip(0), host_mac(99), host_ip(1)), ms(t0, round * 100 + 50));
    }

    let (stats, alerts) = run(source).await;

    assert!(alerts.is_empty());
    assert_eq!(stats.bindings, 10);
    assert_eq!(stats.replies, 200);
    assert_eq!(stats.requests, 20);
}

#[tokio::test]
async fn first_sight_alerts_when_enabled() {
    let mut source = MemorySource::new("eth0");
    source.push(reply(ip5(), AA), Utc::now());

    let detector = DetectorConfig {
        alert_on_first_sight: true,
        ..Default::default()
    };
    let (sink, rx) = ChannelSink::new(16);
    let mut engine = ArpEngine::new(EngineConfig::default(), detector, AlertsConfig::default());
    engine.run(Box::new(source), Arc::new(sink)).await.unwrap();

    let alerts = collect(rx);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::NewBinding);
}

#[tokio::test]
async fn pinned_binding_conflict_is_critical() {
    let config = Config::from_str(
        r#"
        [detector.static_bindings]
        "10.0.0.5" = "aa:aa:aa:aa:aa:aa"
        "#,
    )
    .unwrap();

    let mut source = MemorySource::new("eth0");
    source.push(reply(ip5(), BB), Utc::now());

    let (sink, rx) = ChannelSink::new(16);
    let mut engine = ArpEngine::from_config(&config);
    engine.run(Box::new(source), Arc::new(sink)).await.unwrap();

    let alerts = collect(rx);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, arpsentry::Severity::Critical);
    assert_eq!(engine.detector().lookup(ip5()).map(|b| b.mac), Some(AA));
}

#[tokio::test]
async fn replay_larger_than_frame_queue_loses_nothing() {
    let t0 = Utc::now();
    let mut source = MemorySource::new("eth0");
    let benign = 20_000u16;
    for n in 0..benign {
        source.push(reply(host_ip(n), host_mac(n)), ms(t0, n as i64));
    }
    source.push(reply(ip5(), AA), ms(t0, 30_000));
    source.push(reply(ip5(), BB), ms(t0, 30_100));

    let engine_config = EngineConfig {
        frame_queue_capacity: 64,
        ..Default::default()
    };
    let (sink, rx) = ChannelSink::new(16);
    let mut engine = ArpEngine::new(engine_config, DetectorConfig::default(), AlertsConfig::default());
    let stats = engine.run(Box::new(source), Arc::new(sink)).await.unwrap();

    let total = benign as u64 + 2;
    assert_eq!(stats.frames_captured, total);
    assert_eq!(stats.frames_dropped, 0);
    assert_eq!(stats.events_processed, total);

    let alerts = collect(rx);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::MacConflict);
    assert_eq!(alerts[0].ip, ip5());
    assert_eq!(alerts[0].new_mac, BB);
}

#[tokio::test]
async fn live_frame_queue_overflow_is_counted() {
    let t0 = Utc::now();
    let mut source = MemorySource::new("eth0").with_clock(ClockMode::Wall);
    let total = 20_000u16;
    for n in 0..total {
        source.push(reply(host_ip(n), host_mac(n)), ms(t0, n as i64));
    }

    let engine_config = EngineConfig {
        frame_queue_capacity: 1,
        ..Default::default()
    };
    let (sink, _rx) = ChannelSink::new(16);
    let mut engine = ArpEngine::new(engine_config, DetectorConfig::default(), AlertsConfig::default());
    let stats = engine.run(Box::new(source), Arc::new(sink)).await.unwrap();

    assert_eq!(stats.frames_captured, total as u64);
    assert_eq!(stats.frames_dropped + stats.events_processed, total as u64);
    assert_eq!(stats.frames_accounted(), total as u64);
}

struct DownSink {
    attempts: AtomicU64,
}

#[async_trait]
impl AlertSink for DownSink {
    fn name(&self) -> &str {
        "down"
    }

    async fn deliver(&self, _alert: &Alert) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Unavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn unhealthy_sink_does_not_affect_detection() {
    let t0 = Utc::now();
    let mut source = MemorySource::new("eth0");
    for n in 0..5u16 {
        source.push(reply(host_ip(n), AA), ms(t0, n as i64));
        source.push(reply(host_ip(n), BB), ms(t0, 10 + n as i64));
    }

    let alerts_config = AlertsConfig {
        queue_capacity: 2,
        retry_backoff_ms: 5,
        ..Default::default()
    };
    let engine_config = EngineConfig {
        shutdown_grace_ms: 200,
        ..Default::default()
    };
    let sink = Arc::new(DownSink {
        attempts: AtomicU64::new(0),
    });

    let mut engine = ArpEngine::new(engine_config, DetectorConfig::default(), alerts_config);
    let stats = engine.run(Box::new(MemorySourceBox(source)), sink.clone()).await.unwrap();

    assert_eq!(stats.events_processed, 10);
    assert_eq!(stats.conflicts, 5);
    assert_eq!(stats.alerts_emitted, 5);
    assert_eq!(stats.alerts_delivered, 0);
    assert_eq!(stats.alerts_dropped, 5);
    assert!(stats.sink_errors >= 1);
    assert!(sink.attempts.load(Ordering::SeqCst) >= 1);
}

/// Wraps a MemorySource to exercise a foreign `CaptureSource` impl
struct MemorySourceBox(MemorySource);

impl CaptureSource for MemorySourceBox {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn next_frame(&mut self) -> arpsentry::Result<CaptureEvent> {
        self.0.next_frame()
    }

    fn clock(&self) -> ClockMode {
        self.0.clock()
    }

    fn stats(&self) -> CaptureStats {
        self.0.stats()
    }

    fn close(&mut self) {
        self.0.close()
    }
}

/// Live-like source: a few frames, then read timeouts until closed
struct IdleSource {
    frames: Vec<RawFrame>,
    stats: CaptureStats,
}

impl IdleSource {
    fn new(frames: Vec<Vec<u8>>) -> Self {
        let frames = frames
            .into_iter()
            .rev()
            .map(|data| RawFrame::new(data, Utc::now(), Arc::from("eth1")))
            .collect();
        Self {
            frames,
            stats: CaptureStats::default(),
        }
    }
}

impl CaptureSource for IdleSource {
    fn name(&self) -> &str {
        "idle"
    }

    fn next_frame(&mut self) -> arpsentry::Result<CaptureEvent> {
        match self.frames.pop() {
            Some(frame) => {
                self.stats.received += 1;
                Ok(CaptureEvent::Frame(frame))
            }
            None => {
                std::thread::sleep(Duration::from_millis(5));
                Ok(CaptureEvent::Timeout)
            }
        }
    }

    fn clock(&self) -> ClockMode {
        ClockMode::Wall
    }

    fn stats(&self) -> CaptureStats {
        self.stats.clone()
    }

    fn close(&mut self) {}
}

#[tokio::test]
async fn wall_clock_tick_resolves_window_while_running() {
    let detector = DetectorConfig {
        conflict_debounce: arpsentry::detector::DebounceConfig {
            count: 3,
            window_ms: 100,
        },
        ..Default::default()
    };
    let engine_config = EngineConfig {
        tick_interval_ms: 10,
        ..Default::default()
    };

    let (sink, mut rx) = ChannelSink::new(16);
    let mut engine = ArpEngine::new(engine_config, detector, AlertsConfig::default());
    let source = IdleSource::new(vec![reply(ip5(), AA), reply(ip5(), BB)]);
    engine.start(Box::new(source), Arc::new(sink)).await.unwrap();
    assert!(engine.is_running());

    // Delivered by the periodic tick, before any shutdown drain
    let alert = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("alert before timeout")
        .unwrap();
    assert_eq!(alert.kind, AlertKind::MacConflict);
    assert_eq!(alert.interface, "eth1");

    engine.shutdown();
    let stats = engine.wait().await.unwrap();
    assert_eq!(stats.frames_captured, 2);
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn explicit_shutdown_is_bounded() {
    let engine_config = EngineConfig {
        shutdown_grace_ms: 500,
        ..Default::default()
    };
    let (sink, _rx) = ChannelSink::new(16);
    let mut engine = ArpEngine::new(engine_config, DetectorConfig::default(), AlertsConfig::default());
    engine.start(Box::new(IdleSource::new(Vec::new())), Arc::new(sink)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let handle = engine.shutdown_handle();
    handle.shutdown();

    let started = std::time::Instant::now();
    engine.wait().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(engine.state(), EngineState::Stopped);
}
