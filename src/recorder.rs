//! Records bus traffic twice: unmodified, and with normalized IDs so that the
//! same message always shows up under the same ID in DBC tooling.

use crate::bus::CanBus;
use crate::canlog::CanutilsLogWriter;
use crate::error::Result;
use crate::protocol::CanFrame;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Frames between two progress callbacks, about one second of traffic.
pub const PROGRESS_INTERVAL: u64 = 250;

pub fn log_file_paths(directory: &Path, started: &DateTime<Utc>) -> (PathBuf, PathBuf) {
    let epoch = started.timestamp();
    (
        directory.join(format!("boosted_log_{epoch}_all.log")),
        directory.join(format!("boosted_log_{epoch}_MOD.log")),
    )
}

pub struct Recorder<W: Write> {
    all: CanutilsLogWriter<W>,
    normalized: CanutilsLogWriter<W>,
}

impl Recorder<File> {
    pub fn create(directory: &Path, channel: &str, started: &DateTime<Utc>) -> Result<Self> {
        let (all, normalized) = log_file_paths(directory, started);
        log::info!("Logging to {all:?} and {normalized:?}");
        Ok(Self::new(
            CanutilsLogWriter::create(all, channel)?,
            CanutilsLogWriter::create(normalized, channel)?,
        ))
    }
}

impl<W: Write> Recorder<W> {
    pub fn new(all: CanutilsLogWriter<W>, normalized: CanutilsLogWriter<W>) -> Self {
        Self { all, normalized }
    }

    pub fn record(&mut self, timestamp: &DateTime<Utc>, frame: &CanFrame) -> Result<()> {
        self.all.write(timestamp, frame)?;
        self.normalized.write(timestamp, &frame.normalized())
    }

    pub fn frames(&self) -> u64 {
        self.all.frames()
    }

    /// Flushes both logs and returns the number of recorded frames.
    pub fn finish(self) -> Result<u64> {
        self.normalized.finish()?;
        self.all.finish()
    }
}

/// Records until `cancel` is set or the bus is exhausted.
///
/// `progress` is called with the frame count every [`PROGRESS_INTERVAL`] frames.
pub fn run<B, W, F>(
    bus: &mut B,
    mut recorder: Recorder<W>,
    poll_timeout: Duration,
    cancel: &AtomicBool,
    mut progress: F,
) -> Result<u64>
where
    B: CanBus + ?Sized,
    W: Write,
    F: FnMut(u64),
{
    while !cancel.load(Ordering::Relaxed) {
        match bus.recv(poll_timeout)? {
            Some(frame) => {
                recorder.record(&Utc::now(), &frame)?;
                if recorder.frames() % PROGRESS_INTERVAL == 0 {
                    progress(recorder.frames());
                }
            }
            None if bus.is_exhausted() => break,
            None => {}
        }
    }
    let frames = recorder.finish()?;
    log::info!("Logging stopped, received {frames} frames");
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ReplayBus;
    use crate::canlog::read_log_file;

    #[test]
    fn file_names_carry_start_epoch() {
        let started = DateTime::<Utc>::from_timestamp(1_697_000_000, 0).unwrap();
        let (all, normalized) = log_file_paths(Path::new("/tmp/logs"), &started);
        assert_eq!(all, Path::new("/tmp/logs/boosted_log_1697000000_all.log"));
        assert_eq!(
            normalized,
            Path::new("/tmp/logs/boosted_log_1697000000_MOD.log")
        );
    }

    #[test]
    fn records_raw_and_normalized_streams() {
        let directory = tempfile::tempdir().unwrap();
        let started = Utc::now();
        let recorder = Recorder::create(directory.path(), "can0", &started).unwrap();
        let frames: Vec<CanFrame> = (0..600u32)
            .map(|i| CanFrame::new(0x1030_4200 | (i % 16) | ((i % 4) << 20), &[i as u8]).unwrap())
            .collect();
        let mut bus = ReplayBus::new(frames.clone());
        let mut progress = Vec::new();

        let count = run(
            &mut bus,
            recorder,
            Duration::from_millis(10),
            &AtomicBool::new(false),
            |n| progress.push(n),
        )
        .unwrap();

        assert_eq!(count, 600);
        assert_eq!(progress, vec![250, 500]);
        let (all, normalized) = log_file_paths(directory.path(), &started);
        let all = read_log_file(all).unwrap();
        let normalized = read_log_file(normalized).unwrap();
        assert_eq!(all.len(), 600);
        assert_eq!(all[5].frame, frames[5]);
        assert!(normalized.iter().all(|e| e.frame.id() == 0x1000_4200));
        assert_eq!(normalized[5].frame.data(), frames[5].data());
    }

    #[test]
    fn stops_when_cancelled() {
        let mut bus = ReplayBus::new(vec![CanFrame::new(0x10, &[]).unwrap(); 10]);
        let recorder = Recorder::new(
            CanutilsLogWriter::new(Vec::new(), "can0"),
            CanutilsLogWriter::new(Vec::new(), "can0"),
        );
        let count = run(
            &mut bus,
            recorder,
            Duration::from_millis(10),
            &AtomicBool::new(true),
            |_| {},
        )
        .unwrap();
        assert_eq!(count, 0);
        assert_eq!(bus.remaining(), 10);
    }
}
