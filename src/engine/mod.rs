//! ARP engine
//!
//! Capture, detection and alert delivery wired into one pipeline.
//!
//! # Architecture
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Capture   │────▶│ Frame queue  │────▶│   Workers    │────▶│ Alert queue  │
//! │  (thread)   │     │  (bounded)   │     │  (N threads) │     │ (drop-oldest)│
//! └─────────────┘     └──────────────┘     └──────────────┘     └──────────────┘
//!                                                │                     │
//!                                                ▼                     ▼
//!                                         ┌──────────────┐     ┌──────────────┐
//!                                         │   Detector   │     │  Delivery    │
//!                                         │ + bindings   │     │  task → sink │
//!                                         └──────────────┘     └──────────────┘
//!                                                ▲
//!                                         ┌──────────────┐
//!                                         │   Sweeper    │
//!                                         │ (tick/sweep) │
//!                                         └──────────────┘
//! ```
//!
//! Shutdown runs in four stages: stop capture, drain queued frames through
//! the workers, flush alerts within the grace period, terminate. The source
//! reaching end of stream triggers the same sequence.

pub mod capture;
pub mod pipeline;
pub mod stats;
pub mod workers;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::detector::{Detector, DetectorConfig};
use crate::error::{Error, Result};
use crate::output::{AlertDispatcher, AlertQueue, AlertSink, AlertsConfig};

pub use capture::{
    create_source, CaptureConfig, CaptureEvent, CaptureSource, CaptureStats, ClockMode, MemorySource,
    PcapFileSource,
};
#[cfg(feature = "live")]
pub use capture::live::LiveCapture;
pub use pipeline::{FrameProcessor, FrameQueue};
pub use stats::{EngineCounters, EngineStats};
pub use workers::WorkerPool;

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Raw frames buffered between capture and workers
    #[serde(default = "default_frame_queue_capacity")]
    pub frame_queue_capacity: usize,
    /// Worker threads (0 = one per CPU)
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Idle-binding sweep interval (seconds)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Debounce window check interval (milliseconds)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Upper bound for each shutdown stage (milliseconds)
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_frame_queue_capacity() -> usize { 4096 }
fn default_workers() -> usize { 1 }
fn default_sweep_interval_secs() -> u64 { 5 }
fn default_tick_interval_ms() -> u64 { 250 }
fn default_shutdown_grace_ms() -> u64 { 2000 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_queue_capacity: default_frame_queue_capacity(),
            workers: default_workers(),
            sweep_interval_secs: default_sweep_interval_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl EngineConfig {
    /// Get actual number of workers
    pub fn actual_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Not started, or stopped cleanly
    Stopped,
    Starting,
    Running,
    /// Shutdown in progress
    Stopping,
    /// Stopped by an internal failure
    Error,
}

/// Stop signal, state and first fault, shared by every pipeline stage
pub(crate) struct Control {
    state: RwLock<EngineState>,
    stop_tx: watch::Sender<bool>,
    fault: Mutex<Option<Error>>,
}

impl Control {
    pub(crate) fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            state: RwLock::new(EngineState::Stopped),
            stop_tx,
            fault: Mutex::new(None),
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub(crate) fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Record a fatal failure and stop the pipeline. The first fault wins.
    pub(crate) fn fail(&self, err: Error) {
        {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                error!("ARP engine failed: {}", err);
                *fault = Some(err);
            }
        }
        *self.state.write() = EngineState::Error;
        self.request_stop();
    }

    pub(crate) fn failed(&self) -> bool {
        self.fault.lock().is_some()
    }

    fn take_fault(&self) -> Option<Error> {
        self.fault.lock().take()
    }

    fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Transition unless the engine already failed
    fn set_state(&self, next: EngineState) {
        let mut state = self.state.write();
        if *state != EngineState::Error {
            *state = next;
        }
    }
}

/// Main ARP monitoring engine
pub struct ArpEngine {
    config: EngineConfig,
    alerts_config: AlertsConfig,
    detector: Arc<Detector>,
    counters: Arc<EngineCounters>,
    control: Arc<Control>,
    alerts: Option<Arc<AlertQueue>>,
    supervisor: Option<JoinHandle<Result<()>>>,
}

impl ArpEngine {
    pub fn new(config: EngineConfig, detector: DetectorConfig, alerts: AlertsConfig) -> Self {
        Self::with_detector(config, Arc::new(Detector::new(detector)), alerts)
    }

    /// Run over an existing detector (shared table, custom pinning)
    pub fn with_detector(config: EngineConfig, detector: Arc<Detector>, alerts: AlertsConfig) -> Self {
        Self {
            config,
            alerts_config: alerts,
            detector,
            counters: Arc::new(EngineCounters::new()),
            control: Arc::new(Control::new()),
            alerts: None,
            supervisor: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.engine.clone(),
            config.detector.clone(),
            config.alerts.clone(),
        )
    }

    pub fn state(&self) -> EngineState {
        self.control.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn detector(&self) -> &Arc<Detector> {
        &self.detector
    }

    pub fn stats(&self) -> EngineStats {
        let dispatch = self.alerts.as_ref().map(|q| q.stats());
        EngineStats::collect(
            &self.counters,
            &self.detector.stats(),
            &self.detector.table().stats(),
            dispatch.as_ref(),
        )
    }

    /// Spawn capture, workers, sweeper and alert delivery, then return.
    /// Must be called inside a tokio runtime. An engine runs once.
    pub async fn start(&mut self, source: Box<dyn CaptureSource>, sink: Arc<dyn AlertSink>) -> Result<()> {
        {
            let mut state = self.control.state.write();
            if *state != EngineState::Stopped || self.alerts.is_some() {
                return Err(Error::Engine("engine already started".to_string()));
            }
            *state = EngineState::Starting;
        }

        info!("Starting ARP engine on {}...", source.name());

        let dispatcher = AlertDispatcher::spawn(sink, &self.alerts_config);
        let alerts = dispatcher.queue();
        self.alerts = Some(alerts.clone());

        let processor = Arc::new(FrameProcessor::new(
            self.detector.clone(),
            alerts,
            self.counters.clone(),
        ));

        let (queue, frames) = FrameQueue::bounded(self.config.frame_queue_capacity, self.counters.clone());

        // Set before any stage runs so a source that ends at once cannot be
        // overtaken by the supervisor's Stopped
        self.control.set_state(EngineState::Running);

        let clock = source.clock();
        let capture_control = self.control.clone();
        let capture_counters = self.counters.clone();
        let capture = std::thread::Builder::new()
            .name("arp-capture".to_string())
            .spawn(move || pipeline::capture_loop(source, queue, capture_control, capture_counters))
            .map_err(|e| {
                *self.control.state.write() = EngineState::Error;
                Error::Engine(format!("failed to spawn capture thread: {}", e))
            })?;

        let workers = match WorkerPool::spawn(
            self.config.actual_workers(),
            frames,
            processor.clone(),
            self.control.clone(),
        ) {
            Ok(workers) => workers,
            Err(e) => {
                self.control.fail(Error::Engine(format!("failed to spawn workers: {}", e)));
                let _ = capture.join();
                return Err(Error::Engine(e.to_string()));
            }
        };
        debug!("{} workers, clock {:?}", workers.len(), clock);

        let sweeper = tokio::spawn(sweeper_loop(
            processor.clone(),
            self.control.clone(),
            clock,
            self.config.clone(),
        ));

        self.supervisor = Some(tokio::spawn(supervise(
            self.control.clone(),
            capture,
            workers,
            sweeper,
            dispatcher,
            processor,
            self.config.shutdown_grace(),
        )));

        info!("ARP engine started");
        Ok(())
    }

    /// Request cooperative shutdown; `wait` observes completion
    pub fn shutdown(&self) {
        self.shutdown_handle().shutdown();
    }

    /// Detached handle for signal handlers and other tasks
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            control: self.control.clone(),
        }
    }

    /// Wait for the pipeline to terminate. Returns the final statistics, or
    /// the fault that stopped the engine.
    pub async fn wait(&mut self) -> Result<EngineStats> {
        let supervisor = self
            .supervisor
            .take()
            .ok_or_else(|| Error::Engine("engine not started".to_string()))?;

        supervisor
            .await
            .map_err(|e| Error::Engine(format!("supervisor task failed: {}", e)))??;
        Ok(self.stats())
    }

    /// Start and wait for the source to end (or `shutdown`)
    pub async fn run(&mut self, source: Box<dyn CaptureSource>, sink: Arc<dyn AlertSink>) -> Result<EngineStats> {
        self.start(source, sink).await?;
        self.wait().await
    }
}

/// Requests shutdown of the engine it was taken from
#[derive(Clone)]
pub struct ShutdownHandle {
    control: Arc<Control>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if !self.control.stop_requested() {
            info!("Stopping ARP engine...");
        }
        self.control.request_stop();
    }
}

impl Default for ArpEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default(), DetectorConfig::default(), AlertsConfig::default())
    }
}

fn clock_now(clock: ClockMode, detector: &Detector) -> Option<DateTime<Utc>> {
    match clock {
        ClockMode::Wall => Some(Utc::now()),
        ClockMode::EventTime => detector.watermark(),
    }
}

/// Periodic debounce tick and idle-binding sweep
async fn sweeper_loop(
    processor: Arc<FrameProcessor>,
    control: Arc<Control>,
    clock: ClockMode,
    config: EngineConfig,
) {
    let detector = processor.detector().clone();
    let mut stop = control.subscribe();

    let mut tick = tokio::time::interval(config.tick_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sweep = tokio::time::interval(config.sweep_interval());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *stop.borrow() {
            break;
        }

        tokio::select! {
            _ = tick.tick() => {
                if let Some(now) = clock_now(clock, &detector) {
                    processor.emit(detector.tick(now));
                }
            }
            _ = sweep.tick() => {
                let Some(now) = clock_now(clock, &detector) else { continue };
                match detector.sweep(now) {
                    Ok(0) => {}
                    Ok(n) => debug!("expired {} idle bindings", n),
                    Err(e) => {
                        control.fail(Error::Table(e));
                        break;
                    }
                }
            }
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

/// Waits for the stop signal and runs the shutdown stages
async fn supervise(
    control: Arc<Control>,
    capture: std::thread::JoinHandle<()>,
    workers: WorkerPool,
    sweeper: JoinHandle<()>,
    mut dispatcher: AlertDispatcher,
    processor: Arc<FrameProcessor>,
    grace: Duration,
) -> Result<()> {
    let mut stop = control.subscribe();
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            break;
        }
    }
    control.set_state(EngineState::Stopping);

    join_within("capture", grace, move || {
        if capture.join().is_err() {
            error!("capture thread panicked");
        }
    })
    .await;

    join_within("workers", grace, move || workers.join()).await;

    if tokio::time::timeout(grace, sweeper).await.is_err() {
        warn!("sweeper did not stop within {} ms", grace.as_millis());
    }

    if !control.failed() {
        processor.emit(processor.detector().drain());
    }

    let delivered = dispatcher.shutdown(grace).await;
    info!(
        "alerts: {} delivered, {} dropped, {} sink errors",
        delivered.delivered, delivered.dropped, delivered.sink_errors
    );

    match control.take_fault() {
        Some(e) => Err(e),
        None => {
            control.set_state(EngineState::Stopped);
            info!("ARP engine stopped");
            Ok(())
        }
    }
}

/// Run a blocking join off the runtime, giving up after `grace`
async fn join_within<F>(what: &str, grace: Duration, join: F)
where
    F: FnOnce() + Send + 'static,
{
    if tokio::time::timeout(grace, tokio::task::spawn_blocking(join)).await.is_err() {
        warn!("{} did not stop within {} ms", what, grace.as_millis());
    }
}
