//! Alert output
//!
//! The detector hands alerts to an `AlertDispatcher`, which queues them
//! (bounded, drop-oldest) and delivers them to an `AlertSink` from its own
//! task. Detection never waits on a sink.

pub mod dispatcher;
pub mod sinks;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::event::Alert;
use crate::error::SinkError;

pub use dispatcher::{AlertDispatcher, AlertQueue, DispatchStats};
pub use sinks::{ChannelSink, FanoutSink, JsonLinesSink, LogSink};

/// Consumer of alerts (log, file, webhook, metrics...)
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Sink name for logs
    fn name(&self) -> &str;

    /// Deliver one alert. An `Err` marks the sink unhealthy; the dispatcher
    /// requeues and backs off, it never retries inline.
    async fn deliver(&self, alert: &Alert) -> Result<(), SinkError>;
}

/// Alert delivery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Pending alerts kept while the sink is slow; oldest dropped beyond this
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Per-delivery timeout (milliseconds)
    #[serde(default = "default_deliver_timeout_ms")]
    pub deliver_timeout_ms: u64,
    /// Pause after a failed delivery (milliseconds)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Log alerts through tracing
    #[serde(default = "default_true")]
    pub log: bool,
    /// Append alerts as JSON lines to this file
    #[serde(default)]
    pub json_path: Option<PathBuf>,
}

fn default_queue_capacity() -> usize { 1024 }
fn default_deliver_timeout_ms() -> u64 { 500 }
fn default_retry_backoff_ms() -> u64 { 250 }
fn default_true() -> bool { true }

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            deliver_timeout_ms: default_deliver_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            log: true,
            json_path: None,
        }
    }
}

impl AlertsConfig {
    pub fn deliver_timeout(&self) -> Duration {
        Duration::from_millis(self.deliver_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
