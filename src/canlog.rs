//! can-utils text log files, one frame per line:
//!
//! ```text
//! (1697000000.123456) can0 10374204#300C3B0CBB9B0000
//! ```

use crate::error::{Error, Result};
use crate::protocol::CanFrame;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub frame: CanFrame,
}

pub fn format_entry(timestamp: &DateTime<Utc>, channel: &str, frame: &CanFrame) -> String {
    format!(
        "({}.{:06}) {} {}",
        timestamp.timestamp(),
        timestamp.timestamp_subsec_micros(),
        channel,
        frame
    )
}

/// Parses one log line. Blank lines and remote frames yield `None`.
pub fn parse_line(line: &str, line_no: usize) -> Result<Option<LogEntry>> {
    let fail = |reason: &str| Error::LogParse {
        line: line_no,
        reason: reason.to_string(),
    };
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let mut fields = line.split_whitespace();
    let (Some(stamp), Some(channel), Some(body)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(fail("expected '(timestamp) channel id#data'"));
    };

    let stamp = stamp
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| fail("timestamp not in parentheses"))?;
    let (secs, micros) = stamp.split_once('.').unwrap_or((stamp, "0"));
    if !micros.is_ascii() {
        return Err(fail("invalid timestamp fraction"));
    }
    let secs: i64 = secs.parse().map_err(|_| fail("invalid timestamp seconds"))?;
    let micros: u32 = format!("{micros:0<6}")[..6]
        .parse()
        .map_err(|_| fail("invalid timestamp fraction"))?;
    let timestamp = DateTime::<Utc>::from_timestamp(secs, micros * 1_000)
        .ok_or_else(|| fail("timestamp out of range"))?;

    let (id, data) = body
        .split_once('#')
        .ok_or_else(|| fail("missing '#' separator"))?;
    if data.starts_with('R') {
        log::trace!("Skipping remote frame on line {line_no}");
        return Ok(None);
    }
    let id = u32::from_str_radix(id, 16).map_err(|_| fail("invalid arbitration id"))?;
    if data.len() % 2 != 0 || !data.is_ascii() {
        return Err(fail("odd number of data digits"));
    }
    let data = (0..data.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&data[i..i + 2], 16))
        .collect::<std::result::Result<Vec<u8>, _>>()
        .map_err(|_| fail("invalid data byte"))?;
    let frame = CanFrame::new(id, &data).map_err(|err| fail(&err.to_string()))?;

    Ok(Some(LogEntry {
        timestamp,
        channel: channel.to_string(),
        frame,
    }))
}

pub fn read_log(reader: impl BufRead) -> Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        if let Some(entry) = parse_line(&line?, index + 1)? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

pub fn read_log_file(path: impl AsRef<Path>) -> Result<Vec<LogEntry>> {
    let path = path.as_ref();
    log::debug!("Reading can-utils log {path:?}");
    read_log(BufReader::new(File::open(path)?))
}

/// Appends frames to a can-utils log.
///
/// Output is buffered; call [`CanutilsLogWriter::finish`] to observe flush errors,
/// dropping the writer flushes on a best effort basis.
pub struct CanutilsLogWriter<W: Write> {
    out: BufWriter<W>,
    channel: String,
    frames: u64,
}

impl CanutilsLogWriter<File> {
    pub fn create(path: impl AsRef<Path>, channel: &str) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Creating can-utils log {path:?}");
        Ok(Self::new(File::create(path)?, channel))
    }
}

impl<W: Write> CanutilsLogWriter<W> {
    pub fn new(out: W, channel: &str) -> Self {
        Self {
            out: BufWriter::new(out),
            channel: channel.to_string(),
            frames: 0,
        }
    }

    pub fn write(&mut self, timestamp: &DateTime<Utc>, frame: &CanFrame) -> Result<()> {
        writeln!(
            self.out,
            "{}",
            format_entry(timestamp, &self.channel, frame)
        )?;
        self.frames += 1;
        Ok(())
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn finish(mut self) -> Result<u64> {
        self.out.flush()?;
        Ok(self.frames)
    }
}
