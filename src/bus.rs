//! Transport contract shared by all CAN adapters.
//!
//! Adapters implement [`CanBus`] for the receive loop and hand out
//! [`FrameSender`] handles which may be used from other threads, e.g. by a
//! [`PeriodicSender`]. Closing an adapter is done by dropping it.

use crate::error::Result;
use crate::protocol::CanFrame;
use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Bitrate of the Boosted board bus.
pub const DEFAULT_BITRATE: u32 = 250_000;

/// Send half of a CAN adapter. Implementations must be safe for concurrent callers.
pub trait FrameSender: Send + Sync {
    fn send(&self, frame: &CanFrame) -> Result<()>;
}

pub trait CanBus {
    /// Waits up to `timeout` for the next frame.
    fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>>;

    fn send(&mut self, frame: &CanFrame) -> Result<()>;

    /// A handle sharing this adapter's send path.
    fn sender(&self) -> Arc<dyn FrameSender>;

    /// True once no further frame can ever arrive, e.g. at the end of a recording.
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Sends a fixed frame on a fixed interval from a background thread.
///
/// The thread is stopped and joined when the handle is dropped.
pub struct PeriodicSender {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PeriodicSender {
    pub fn start(sender: Arc<dyn FrameSender>, frame: CanFrame, interval: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            log::debug!("Periodic send of {frame} every {interval:?} started");
            loop {
                if let Err(err) = sender.send(&frame) {
                    log::warn!("Periodic send of {frame} failed: {err}");
                }
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            log::debug!("Periodic send of {frame} stopped");
        });
        Self {
            stop: Some(stop),
            thread: Some(thread),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Periodic sender thread panicked");
            }
        }
    }
}

impl Drop for PeriodicSender {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Frames written to a [`ReplayBus`], shared with its senders.
#[derive(Debug, Clone, Default)]
pub struct SentFrames(Arc<Mutex<Vec<CanFrame>>>);

impl SentFrames {
    pub fn snapshot(&self) -> Vec<CanFrame> {
        self.0.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    fn push(&self, frame: CanFrame) {
        if let Ok(mut sent) = self.0.lock() {
            sent.push(frame);
        }
    }
}

impl FrameSender for SentFrames {
    fn send(&self, frame: &CanFrame) -> Result<()> {
        log::trace!("replay send: {frame}");
        self.push(*frame);
        Ok(())
    }
}

/// An offline bus that plays back a recorded frame sequence and records everything sent.
///
/// Once the recording is exhausted `recv` reports a timeout, like a silent bus.
#[derive(Debug, Default)]
pub struct ReplayBus {
    frames: VecDeque<CanFrame>,
    sent: SentFrames,
}

impl ReplayBus {
    pub fn new(frames: impl IntoIterator<Item = CanFrame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            sent: SentFrames::default(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }

    pub fn sent(&self) -> SentFrames {
        self.sent.clone()
    }
}

impl CanBus for ReplayBus {
    fn recv(&mut self, _timeout: Duration) -> Result<Option<CanFrame>> {
        Ok(self.frames.pop_front())
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        self.sent.send(frame)
    }

    fn sender(&self) -> Arc<dyn FrameSender> {
        Arc::new(self.sent.clone())
    }

    fn is_exhausted(&self) -> bool {
        self.frames.is_empty()
    }
}
