//! Built-in alert sinks

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use super::AlertSink;
use crate::core::event::{Alert, Severity};
use crate::error::SinkError;

/// Writes alerts through tracing, level chosen by severity
#[derive(Debug, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), SinkError> {
        match alert.severity {
            Severity::Critical | Severity::High => error!(
                kind = %alert.kind,
                ip = %alert.ip,
                evidence = alert.evidence_count,
                "{}",
                alert.message
            ),
            Severity::Medium | Severity::Low => warn!(
                kind = %alert.kind,
                ip = %alert.ip,
                evidence = alert.evidence_count,
                "{}",
                alert.message
            ),
            Severity::Info => info!(kind = %alert.kind, ip = %alert.ip, "{}", alert.message),
        }
        Ok(())
    }
}

/// Appends one JSON object per line
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonLinesSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AlertSink for JsonLinesSink {
    fn name(&self) -> &str {
        "json"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(alert)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Forwards alerts to an in-process receiver
pub struct ChannelSink {
    tx: mpsc::Sender<Alert>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AlertSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    /// Waits for capacity; the dispatcher timeout bounds the wait
    async fn deliver(&self, alert: &Alert) -> Result<(), SinkError> {
        self.tx
            .send(alert.clone())
            .await
            .map_err(|_| SinkError::Unavailable("receiver closed".to_string()))
    }
}

/// Delivers to several sinks. Succeeds if at least one sink accepted the
/// alert so a single broken sink does not cause repeats on the others.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl AlertSink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), SinkError> {
        let mut last_err = None;
        let mut delivered = 0;

        for sink in &self.sinks {
            match sink.deliver(alert).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("sink '{}' failed: {}", sink.name(), e);
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{AlertKind, MacAddr};
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    fn conflict() -> Alert {
        Alert::new(
            AlertKind::MacConflict,
            Ipv4Addr::new(10, 0, 0, 5),
            Some(MacAddr([0xaa; 6])),
            MacAddr([0xbb; 6]),
            Utc::now(),
        )
        .with_interface("eth0")
    }

    struct BrokenSink;

    #[async_trait]
    impl AlertSink for BrokenSink {
        fn name(&self) -> &str {
            "broken"
        }

        async fn deliver(&self, _alert: &Alert) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("broken".to_string()))
        }
    }

    #[tokio::test]
    async fn test_json_lines_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alerts.jsonl");

        let sink = JsonLinesSink::open(&path).await.unwrap();
        sink.deliver(&conflict()).await.unwrap();
        sink.deliver(&conflict()).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: Alert = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.kind, AlertKind::MacConflict);
        assert_eq!(parsed.old_mac, Some(MacAddr([0xaa; 6])));
        assert!(lines[0].contains("\"bb:bb:bb:bb:bb:bb\""));
    }

    #[tokio::test]
    async fn test_channel_sink_closed_receiver() {
        let (sink, rx) = ChannelSink::new(1);
        drop(rx);
        assert!(matches!(
            sink.deliver(&conflict()).await,
            Err(SinkError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_fanout_tolerates_one_broken_sink() {
        let (channel, mut rx) = ChannelSink::new(4);
        let fanout = FanoutSink::new(vec![Arc::new(BrokenSink), Arc::new(channel)]);

        fanout.deliver(&conflict()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().ip, Ipv4Addr::new(10, 0, 0, 5));

        let all_broken = FanoutSink::new(vec![Arc::new(BrokenSink)]);
        assert!(all_broken.deliver(&conflict()).await.is_err());
    }

    #[tokio::test]
    async fn test_log_sink_never_fails() {
        let sink = LogSink::new();
        assert!(sink.deliver(&conflict()).await.is_ok());
    }
}
