//! Configuration file support
//!
//! Loads the TOML configuration, applies `ARPSENTRY_*` environment
//! overrides and validates the result.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::detector::{ConflictPolicy, DetectorConfig};
use crate::engine::{CaptureConfig, EngineConfig};
use crate::error::ConfigError;
use crate::output::AlertsConfig;

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration structure
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Binding and conflict classification
    pub detector: DetectorConfig,

    /// Queues, workers and shutdown
    pub engine: EngineConfig,

    /// Alert delivery
    pub alerts: AlertsConfig,

    /// Frame source
    pub capture: CaptureConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize configuration to a TOML string
    pub fn to_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_string()?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| ConfigError::Read(format!("failed to write {}: {}", path.as_ref().display(), e)))
    }

    /// Generate default config file content with comments
    pub fn default_with_comments() -> &'static str {
        DEFAULT_CONFIG
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - ARPSENTRY_INTERFACE, ARPSENTRY_PCAP_FILE
    /// - ARPSENTRY_IDLE_INTERVAL_SECS, ARPSENTRY_ALERT_ON_FIRST_SIGHT
    /// - ARPSENTRY_CONFLICT_POLICY (hold_old_mac | adopt_new_mac)
    /// - ARPSENTRY_DEBOUNCE_COUNT, ARPSENTRY_DEBOUNCE_WINDOW_MS
    /// - ARPSENTRY_WORKERS, ARPSENTRY_FRAME_QUEUE_CAPACITY
    /// - ARPSENTRY_ALERT_QUEUE_CAPACITY, ARPSENTRY_ALERTS_JSON_PATH
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup (environment, tests)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Capture
        if let Some(v) = lookup("ARPSENTRY_INTERFACE") {
            self.capture.interface = Some(v);
        }
        if let Some(v) = lookup("ARPSENTRY_PCAP_FILE") {
            self.capture.pcap_file = Some(PathBuf::from(v));
        }

        // Detector
        if let Some(v) = lookup("ARPSENTRY_IDLE_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                self.detector.idle_interval_secs = secs;
            }
        }
        if let Some(v) = lookup("ARPSENTRY_ALERT_ON_FIRST_SIGHT") {
            self.detector.alert_on_first_sight = parse_bool(&v);
        }
        if let Some(v) = lookup("ARPSENTRY_CONFLICT_POLICY") {
            match v.trim().to_lowercase().as_str() {
                "hold_old_mac" | "hold" => self.detector.conflict_policy = ConflictPolicy::HoldOldMac,
                "adopt_new_mac" | "adopt" => self.detector.conflict_policy = ConflictPolicy::AdoptNewMac,
                _ => {}
            }
        }
        if let Some(v) = lookup("ARPSENTRY_DEBOUNCE_COUNT") {
            if let Ok(count) = v.parse() {
                self.detector.conflict_debounce.count = count;
            }
        }
        if let Some(v) = lookup("ARPSENTRY_DEBOUNCE_WINDOW_MS") {
            if let Ok(ms) = v.parse() {
                self.detector.conflict_debounce.window_ms = ms;
            }
        }

        // Engine
        if let Some(v) = lookup("ARPSENTRY_WORKERS") {
            if let Ok(n) = v.parse() {
                self.engine.workers = n;
            }
        }
        if let Some(v) = lookup("ARPSENTRY_FRAME_QUEUE_CAPACITY") {
            if let Ok(n) = v.parse() {
                self.engine.frame_queue_capacity = n;
            }
        }

        // Alerts
        if let Some(v) = lookup("ARPSENTRY_ALERT_QUEUE_CAPACITY") {
            if let Ok(n) = v.parse() {
                self.alerts.queue_capacity = n;
            }
        }
        if let Some(v) = lookup("ARPSENTRY_ALERTS_JSON_PATH") {
            self.alerts.json_path = Some(PathBuf::from(v));
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let debounce = &self.detector.conflict_debounce;
        if debounce.count < 2 {
            return Err(invalid("detector.conflict_debounce.count must be at least 2"));
        }
        if debounce.window_ms == 0 {
            return Err(invalid("detector.conflict_debounce.window_ms must be positive"));
        }
        if self.detector.idle_interval_secs == 0 {
            return Err(invalid("detector.idle_interval_secs must be positive"));
        }
        for (ip, mac) in &self.detector.static_bindings {
            if mac.is_zero() || mac.is_multicast() {
                return Err(invalid(format!(
                    "detector.static_bindings: {} cannot be pinned to {}",
                    ip, mac
                )));
            }
        }

        if self.engine.frame_queue_capacity == 0 {
            return Err(invalid("engine.frame_queue_capacity must be positive"));
        }
        if self.engine.tick_interval_ms == 0 {
            return Err(invalid("engine.tick_interval_ms must be positive"));
        }

        if self.alerts.queue_capacity == 0 {
            return Err(invalid("alerts.queue_capacity must be positive"));
        }
        if self.alerts.deliver_timeout_ms == 0 {
            return Err(invalid("alerts.deliver_timeout_ms must be positive"));
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

const DEFAULT_CONFIG: &str = r#"# arpsentry configuration
# =======================

[detector]
# Bindings not refreshed for this long are forgotten (seconds)
idle_interval_secs = 300

# Alert when an IP is seen for the first time (noisy on busy networks)
alert_on_first_sight = false

# What happens to the binding when a conflicting reply arrives:
#   hold_old_mac  - keep the old MAC until the binding is reset
#   adopt_new_mac - switch to the new MAC
conflict_policy = "hold_old_mac"

[detector.conflict_debounce]
# Alternating replies between two MACs inside the window that mark the IP
# as flapping (failover, load balancer) instead of a conflict
count = 3
# Window length (milliseconds)
window_ms = 2000

[detector.static_bindings]
# Pinned bindings never expire and never change; any other MAC claiming
# one of these IPs raises a critical alert immediately.
# "192.168.1.1" = "00:11:22:33:44:55"

[engine]
# Raw frames buffered between capture and workers; overflow is dropped
frame_queue_capacity = 4096
# Worker threads (0 = one per CPU). One worker keeps arrival order.
workers = 1
# Idle-binding sweep interval (seconds)
sweep_interval_secs = 5
# Debounce window check interval (milliseconds)
tick_interval_ms = 250
# Upper bound for each shutdown stage (milliseconds)
shutdown_grace_ms = 2000

[alerts]
# Alerts buffered while the sink is slow; the oldest are dropped beyond this
queue_capacity = 1024
# Per-delivery timeout (milliseconds)
deliver_timeout_ms = 500
# Pause after a failed delivery (milliseconds)
retry_backoff_ms = 250
# Log alerts
log = true
# Append alerts as JSON lines
# json_path = "/var/log/arpsentry/alerts.jsonl"

[capture]
# interface = "eth0"
# pcap_file = "capture.pcap"
snaplen = 65535
promiscuous = true
timeout_ms = 100
"#;
