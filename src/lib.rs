//! arpsentry - ARP spoofing detector
//!
//! Watches ARP replies, keeps an IP -> MAC binding table and raises alerts
//! when an IP is claimed by a different MAC. Short alternation between two
//! MACs (failover, load balancers) is classified as flapping instead of a
//! conflict.
//!
//! # Layout
//! - `core`: frames, decoded ARP events, alerts, frame decoder
//! - `binding`: concurrent binding table
//! - `detector`: per-IP classification and conflict debounce
//! - `output`: alert sinks and non-blocking delivery
//! - `engine`: capture sources, frame queue, workers, lifecycle
//! - `config`: TOML configuration

pub mod binding;
pub mod config;
pub mod core;
pub mod detector;
pub mod engine;
pub mod error;
pub mod output;

pub use binding::{Binding, BindingTable, UpsertResult};
pub use config::Config;
pub use crate::core::event::{Alert, AlertKind, ArpEvent, ArpOp, MacAddr, RawFrame, Severity};
pub use crate::core::parser::decode;
pub use detector::{ConflictPolicy, Detector, DetectorConfig};
pub use engine::{ArpEngine, CaptureSource, EngineConfig, EngineState, EngineStats, ShutdownHandle};
pub use error::{ConfigError, DecodeError, Error, Result, SinkError, TableError};
pub use output::{AlertDispatcher, AlertSink, AlertsConfig};
