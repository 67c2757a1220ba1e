//! Capture loop, bounded frame queue and per-frame processing

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError};
use tracing::{debug, error, info, trace, warn};

use super::capture::{CaptureEvent, CaptureSource, ClockMode};
use super::stats::EngineCounters;
use super::Control;
use crate::core::event::RawFrame;
use crate::core::parser::decode;
use crate::detector::Detector;
use crate::error::{DecodeError, Error, TableError};
use crate::output::AlertQueue;

/// Consecutive capture errors tolerated before the engine gives up
const MAX_CAPTURE_ERRORS: u32 = 10;

/// How often a blocked replay hand-off re-checks the stop signal
const BLOCKED_SEND_POLL: Duration = Duration::from_millis(50);

/// Producer side of the bounded raw-frame queue.
///
/// Live capture uses `offer`, which never blocks: a full queue drops the
/// frame and counts it. Replay sources use `offer_blocking` and wait for
/// the workers instead.
pub struct FrameQueue {
    tx: Sender<RawFrame>,
    counters: Arc<EngineCounters>,
}

impl FrameQueue {
    pub fn bounded(capacity: usize, counters: Arc<EngineCounters>) -> (Self, Receiver<RawFrame>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        (Self { tx, counters }, rx)
    }

    /// Returns false if the frame was dropped
    pub fn offer(&self, frame: RawFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = EngineCounters::incr(&self.counters.frames_dropped);
                if dropped % 1000 == 0 {
                    warn!("frame queue full, {} frames dropped so far", dropped + 1);
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Wait for room in the queue. Returns false (frame counted as dropped)
    /// only if stop is requested while waiting.
    pub(crate) fn offer_blocking(&self, mut frame: RawFrame, control: &Control) -> bool {
        loop {
            match self.tx.send_timeout(frame, BLOCKED_SEND_POLL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if control.stop_requested() {
                        EngineCounters::incr(&self.counters.frames_dropped);
                        return false;
                    }
                    frame = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Decode, detect and hand alerts off for one frame
pub struct FrameProcessor {
    detector: Arc<Detector>,
    alerts: Arc<AlertQueue>,
    counters: Arc<EngineCounters>,
}

impl FrameProcessor {
    pub fn new(detector: Arc<Detector>, alerts: Arc<AlertQueue>, counters: Arc<EngineCounters>) -> Self {
        Self {
            detector,
            alerts,
            counters,
        }
    }

    /// Decode errors are counted and swallowed; only a table inconsistency
    /// is returned.
    pub fn handle(&self, frame: &RawFrame) -> Result<(), TableError> {
        let event = match decode(frame) {
            Ok(event) => event,
            Err(DecodeError::Malformed(reason)) => {
                EngineCounters::incr(&self.counters.frames_malformed);
                debug!("dropped malformed frame ({} bytes): {}", frame.len(), reason);
                return Ok(());
            }
            Err(DecodeError::Unsupported(reason)) => {
                EngineCounters::incr(&self.counters.frames_unsupported);
                trace!("skipped frame: {}", reason);
                return Ok(());
            }
        };

        EngineCounters::incr(&self.counters.events_processed);
        let alerts = self.detector.process(&event)?;
        self.emit(alerts);
        Ok(())
    }

    pub fn emit(&self, alerts: Vec<crate::core::event::Alert>) {
        for alert in alerts {
            EngineCounters::incr(&self.counters.alerts_emitted);
            self.alerts.push(alert);
        }
    }

    pub fn detector(&self) -> &Arc<Detector> {
        &self.detector
    }
}

/// Body of the capture thread. Returns when stop is requested or the source
/// ends; dropping `queue` then lets the workers drain and exit.
///
/// Wall-clock sources drop frames on a full queue, event-time (replay)
/// sources wait, so a replay never loses frames to worker speed.
pub(crate) fn capture_loop(
    mut source: Box<dyn CaptureSource>,
    queue: FrameQueue,
    control: Arc<Control>,
    counters: Arc<EngineCounters>,
) {
    info!("Capture started: {}", source.name());
    let clock = source.clock();
    let mut consecutive_errors = 0u32;

    loop {
        if control.stop_requested() {
            break;
        }

        match source.next_frame() {
            Ok(CaptureEvent::Frame(frame)) => {
                consecutive_errors = 0;
                EngineCounters::incr(&counters.frames_captured);
                match clock {
                    ClockMode::Wall => queue.offer(frame),
                    ClockMode::EventTime => queue.offer_blocking(frame, &control),
                };
            }
            Ok(CaptureEvent::Timeout) => {
                consecutive_errors = 0;
            }
            Ok(CaptureEvent::EndOfStream) => {
                info!("{}: end of stream", source.name());
                control.request_stop();
                break;
            }
            Err(e) => {
                EngineCounters::incr(&counters.capture_errors);
                consecutive_errors += 1;
                error!("Capture error: {}", e);
                if consecutive_errors >= MAX_CAPTURE_ERRORS {
                    control.fail(Error::Capture(format!(
                        "{}: giving up after {} consecutive errors",
                        source.name(),
                        consecutive_errors
                    )));
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    source.close();
    let stats = source.stats();
    info!(
        "Capture stopped: {} received, {} kernel drops",
        stats.received, stats.dropped
    );
}
