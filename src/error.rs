use std::net::Ipv4Addr;

use thiserror::Error;

use crate::core::event::MacAddr;

/// Frame decoding failures. Both variants are non-fatal: the frame is
/// discarded and counted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unsupported frame: {0}")]
    Unsupported(String),
}

/// Binding table failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    /// Stored state contradicts the table invariants. Never a network event.
    #[error("binding table inconsistent for {ip}: {reason}")]
    Inconsistent { ip: Ipv4Addr, reason: String },

    #[error("binding for {ip} is pinned to {mac}")]
    Pinned { ip: Ipv4Addr, mac: MacAddr },
}

/// Alert sink failures. The dispatcher treats any of these as "sink unhealthy".
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("sink delivery timed out after {0} ms")]
    Timeout(u64),

    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("alert serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Configuration loading and validation failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("failed to serialize config: {0}")]
    Serialize(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("capture error: {0}")]
    Capture(String),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
