//! Bounded alert queue and delivery task

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{AlertSink, AlertsConfig};
use crate::core::event::Alert;
use crate::error::SinkError;

/// Delivery statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub sink_errors: u64,
    pub timeouts: u64,
    pub pending: usize,
}

/// Bounded FIFO between the detector and the delivery task. Pushing never
/// blocks; when full the oldest alert is dropped.
pub struct AlertQueue {
    alerts: Mutex<VecDeque<Alert>>,
    capacity: usize,
    notify: Notify,
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    sink_errors: AtomicU64,
    timeouts: AtomicU64,
}

impl AlertQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            alerts: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            notify: Notify::new(),
            enqueued: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            sink_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Enqueue an alert. Returns false if an older alert had to be dropped.
    pub fn push(&self, alert: Alert) -> bool {
        let evicted = {
            let mut alerts = self.alerts.lock();
            let evicted = if alerts.len() >= self.capacity {
                alerts.pop_front()
            } else {
                None
            };
            alerts.push_back(alert);
            evicted
        };

        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();

        match evicted {
            Some(old) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("alert queue full, dropped oldest alert for {}", old.ip);
                false
            }
            None => true,
        }
    }

    /// Put a failed alert back at the head. If the queue filled up meanwhile
    /// it is the oldest and is dropped instead.
    fn requeue(&self, alert: Alert) {
        let mut alerts = self.alerts.lock();
        if alerts.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        } else {
            alerts.push_front(alert);
        }
    }

    fn pop(&self) -> Option<Alert> {
        self.alerts.lock().pop_front()
    }

    fn discard_all(&self) -> usize {
        let mut alerts = self.alerts.lock();
        let n = alerts.len();
        alerts.clear();
        self.dropped.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            pending: self.len(),
        }
    }
}

/// Owns the delivery task for one sink
pub struct AlertDispatcher {
    queue: Arc<AlertQueue>,
    /// Flush deadline; `Some` once shutdown was requested
    stop_tx: watch::Sender<Option<Instant>>,
    task: Option<JoinHandle<()>>,
}

impl AlertDispatcher {
    /// Start delivering to `sink`. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn AlertSink>, config: &AlertsConfig) -> Self {
        let queue = Arc::new(AlertQueue::new(config.queue_capacity));
        let (stop_tx, stop_rx) = watch::channel(None);

        let task = tokio::spawn(deliver_loop(
            sink,
            queue.clone(),
            stop_rx,
            config.deliver_timeout(),
            config.retry_backoff(),
        ));

        Self {
            queue,
            stop_tx,
            task: Some(task),
        }
    }

    pub fn queue(&self) -> Arc<AlertQueue> {
        self.queue.clone()
    }

    pub fn push(&self, alert: Alert) -> bool {
        self.queue.push(alert)
    }

    pub fn stats(&self) -> DispatchStats {
        self.queue.stats()
    }

    /// Flush pending alerts for at most `grace`, then stop. Alerts still
    /// queued after the deadline are counted as dropped.
    pub async fn shutdown(&mut self, grace: Duration) -> DispatchStats {
        let deadline = Instant::now() + grace;
        let _ = self.stop_tx.send(Some(deadline));

        if let Some(mut task) = self.task.take() {
            let margin = grace + Duration::from_millis(100);
            if tokio::time::timeout(margin, &mut task).await.is_err() {
                task.abort();
            }
        }

        let left = self.queue.discard_all();
        if left > 0 {
            warn!("{} alerts undelivered at shutdown", left);
        }
        self.queue.stats()
    }
}

impl Drop for AlertDispatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn deliver_loop(
    sink: Arc<dyn AlertSink>,
    queue: Arc<AlertQueue>,
    mut stop_rx: watch::Receiver<Option<Instant>>,
    deliver_timeout: Duration,
    backoff: Duration,
) {
    let mut healthy = true;
    debug!("alert delivery to '{}' started", sink.name());

    loop {
        let deadline = *stop_rx.borrow();
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                break;
            }
        }

        let Some(alert) = queue.pop() else {
            if deadline.is_some() {
                break;
            }
            tokio::select! {
                _ = queue.notify.notified() => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        };

        let attempt = match deadline {
            Some(d) => deliver_timeout.min(d.saturating_duration_since(Instant::now())),
            None => deliver_timeout,
        };

        let failure = match tokio::time::timeout(attempt, sink.deliver(&alert)).await {
            Ok(Ok(())) => {
                queue.delivered.fetch_add(1, Ordering::Relaxed);
                if !healthy {
                    info!("alert sink '{}' recovered", sink.name());
                    healthy = true;
                }
                None
            }
            Ok(Err(e)) => Some(e),
            Err(_) => {
                queue.timeouts.fetch_add(1, Ordering::Relaxed);
                Some(SinkError::Timeout(attempt.as_millis() as u64))
            }
        };

        if let Some(reason) = failure {
            queue.sink_errors.fetch_add(1, Ordering::Relaxed);
            if healthy {
                warn!("alert sink '{}' unhealthy: {}", sink.name(), reason);
                healthy = false;
            }
            queue.requeue(alert);

            let pause = match *stop_rx.borrow() {
                Some(d) => backoff.min(d.saturating_duration_since(Instant::now())),
                None => backoff,
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = stop_rx.changed() => {}
            }
        }
    }

    debug!("alert delivery to '{}' stopped", sink.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{AlertKind, MacAddr};
    use crate::output::ChannelSink;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicBool;

    fn alert(last: u8) -> Alert {
        Alert::new(
            AlertKind::MacConflict,
            Ipv4Addr::new(10, 0, 0, last),
            Some(MacAddr([0xaa; 6])),
            MacAddr([0xbb; 6]),
            Utc::now(),
        )
    }

    struct FlakySink {
        healthy: AtomicBool,
        delivered: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl AlertSink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn deliver(&self, alert: &Alert) -> Result<(), SinkError> {
            if self.healthy.load(Ordering::SeqCst) {
                self.delivered.lock().push(alert.clone());
                Ok(())
            } else {
                Err(SinkError::Unavailable("down".to_string()))
            }
        }
    }

    struct StuckSink;

    #[async_trait]
    impl AlertSink for StuckSink {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn deliver(&self, _alert: &Alert) -> Result<(), SinkError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[test]
    fn test_queue_drops_oldest_when_full() {
        let queue = AlertQueue::new(2);
        assert!(queue.push(alert(1)));
        assert!(queue.push(alert(2)));
        assert!(!queue.push(alert(3)));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.stats().dropped, 1);
        assert_eq!(queue.pop().unwrap().ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(queue.pop().unwrap().ip, Ipv4Addr::new(10, 0, 0, 3));
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new(16);
        let mut dispatcher = AlertDispatcher::spawn(Arc::new(sink), &AlertsConfig::default());

        for i in 1..=3 {
            dispatcher.push(alert(i));
        }
        for i in 1..=3 {
            let got = rx.recv().await.unwrap();
            assert_eq!(got.ip, Ipv4Addr::new(10, 0, 0, i));
        }

        let stats = dispatcher.shutdown(Duration::from_millis(200)).await;
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test]
    async fn test_unhealthy_sink_recovers_without_loss() {
        let sink = Arc::new(FlakySink {
            healthy: AtomicBool::new(false),
            delivered: Mutex::new(Vec::new()),
        });
        let config = AlertsConfig {
            retry_backoff_ms: 10,
            ..Default::default()
        };
        let mut dispatcher = AlertDispatcher::spawn(sink.clone(), &config);

        dispatcher.push(alert(1));
        dispatcher.push(alert(2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dispatcher.stats().sink_errors >= 1);

        sink.healthy.store(true, Ordering::SeqCst);
        let stats = dispatcher.shutdown(Duration::from_secs(1)).await;

        assert_eq!(stats.delivered, 2);
        let delivered = sink.delivered.lock();
        assert_eq!(delivered[0].ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(delivered[1].ip, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[tokio::test]
    async fn test_stuck_sink_times_out_and_shutdown_is_bounded() {
        let config = AlertsConfig {
            deliver_timeout_ms: 20,
            retry_backoff_ms: 10,
            queue_capacity: 4,
            ..Default::default()
        };
        let mut dispatcher = AlertDispatcher::spawn(Arc::new(StuckSink), &config);
        for i in 0..10 {
            dispatcher.push(alert(i));
        }

        let started = std::time::Instant::now();
        let stats = dispatcher.shutdown(Duration::from_millis(100)).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(stats.delivered, 0);
        assert!(stats.timeouts >= 1);
        assert!(stats.dropped >= 6);
        assert_eq!(stats.pending, 0);
    }
}
