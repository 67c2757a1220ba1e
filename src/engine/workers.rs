//! Worker threads pulling frames off the queue
//!
//! Each worker runs `FrameProcessor::handle` on frames in the order it
//! receives them. The detector serialises work per IP, so several workers
//! are safe, but only a single worker keeps global arrival order.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error};

use super::pipeline::FrameProcessor;
use super::Control;
use crate::core::event::RawFrame;
use crate::error::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` threads (at least one)
    pub(crate) fn spawn(
        workers: usize,
        frames: Receiver<RawFrame>,
        processor: Arc<FrameProcessor>,
        control: Arc<Control>,
    ) -> std::io::Result<Self> {
        let mut handles = Vec::with_capacity(workers.max(1));

        for id in 0..workers.max(1) {
            let frames = frames.clone();
            let processor = processor.clone();
            let control = control.clone();

            let handle = std::thread::Builder::new()
                .name(format!("arp-worker-{}", id))
                .spawn(move || worker_loop(id, frames, processor, control))?;
            handles.push(handle);
        }

        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Block until every worker has exited
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

/// Runs until the queue is closed and empty, or the engine failed
fn worker_loop(
    id: usize,
    frames: Receiver<RawFrame>,
    processor: Arc<FrameProcessor>,
    control: Arc<Control>,
) {
    debug!("worker {} started", id);
    let mut handled = 0u64;

    loop {
        if control.failed() {
            break;
        }

        match frames.recv_timeout(POLL_INTERVAL) {
            Ok(frame) => {
                handled += 1;
                if let Err(e) = processor.handle(&frame) {
                    error!("worker {}: {}", id, e);
                    control.fail(Error::Table(e));
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("worker {} stopped after {} frames", id, handled);
}
