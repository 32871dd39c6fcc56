//! CAN adapter speaking the Lawicel `slcan` ASCII protocol over a serial port,
//! as used by CANable style USB dongles.
//!
//! ```no_run
//! use boostedcan_lib::bus::{CanBus, DEFAULT_BITRATE};
//! use boostedcan_lib::slcan::SlcanBus;
//! use std::time::Duration;
//!
//! let mut bus = SlcanBus::open("/dev/ttyACM0", DEFAULT_BITRATE).unwrap();
//! if let Some(frame) = bus.recv(Duration::from_secs(1)).unwrap() {
//!     println!("{frame}");
//! }
//! ```

use crate::bus::{CanBus, FrameSender};
use crate::error::{Error, Result};
use crate::protocol::CanFrame;
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// USB CDC adapters ignore the baud rate, real UARTs usually run slcan at 115200
const SERIAL_BAUD_RATE: u32 = 115_200;
const READ_CHUNK: usize = 64;
const LINE_END: u8 = b'\r';
const BELL: u8 = 0x07;
// a few of the longest lines, T + id + dlc + 8 bytes + timestamp
const MAX_PENDING: usize = 4 * 32;

/// The `Sn` command selecting one of the standard bitrates.
pub fn bitrate_command(bitrate: u32) -> Result<&'static str> {
    Ok(match bitrate {
        10_000 => "S0",
        20_000 => "S1",
        50_000 => "S2",
        100_000 => "S3",
        125_000 => "S4",
        250_000 => "S5",
        500_000 => "S6",
        800_000 => "S7",
        1_000_000 => "S8",
        _ => return Err(Error::Slcan(format!("unsupported bitrate {bitrate}"))),
    })
}

/// Encodes an extended data frame, e.g. `T1034611020D0A\r`.
pub fn encode_frame(frame: &CanFrame) -> String {
    let mut line = format!("T{:08X}{:X}", frame.id(), frame.data().len());
    for byte in frame.data() {
        line.push_str(&format!("{byte:02X}"));
    }
    line.push(LINE_END as char);
    line
}

type RadixParser<T> = fn(&str, u32) -> std::result::Result<T, std::num::ParseIntError>;

fn parse_hex<T>(field: &str, parse: RadixParser<T>) -> Result<T> {
    parse(field, 16).map_err(|err| Error::Slcan(format!("invalid hex field {field:?}: {err}")))
}

/// Decodes one adapter line without its terminator.
///
/// Returns `None` for acknowledgements, standard or remote frames and other
/// adapter chatter.
pub fn decode_line(line: &str) -> Result<Option<CanFrame>> {
    if !line.is_ascii() {
        return Err(Error::Slcan(format!("non ASCII line {line:?}")));
    }
    match line.chars().next() {
        Some('T') => {}
        Some('t') | Some('r') | Some('R') => {
            log::trace!("Ignoring non extended data frame {line:?}");
            return Ok(None);
        }
        _ => {
            log::trace!("Ignoring adapter response {line:?}");
            return Ok(None);
        }
    }
    if line.len() < 10 {
        return Err(Error::Slcan(format!("truncated frame {line:?}")));
    }
    let id = parse_hex(&line[1..9], u32::from_str_radix)?;
    let len = usize::from(parse_hex(&line[9..10], u8::from_str_radix)?);
    let data_end = 10 + len * 2;
    if line.len() < data_end {
        return Err(Error::Slcan(format!("truncated payload {line:?}")));
    }
    let data = (0..len)
        .map(|i| parse_hex(&line[10 + i * 2..12 + i * 2], u8::from_str_radix))
        .collect::<Result<Vec<u8>>>()?;
    CanFrame::new(id, &data).map(Some)
}

struct SlcanWriter {
    serial: Mutex<Box<dyn serialport::SerialPort>>,
}

impl SlcanWriter {
    fn write_line(&self, line: &str) -> Result<()> {
        let mut serial = self
            .serial
            .lock()
            .map_err(|_| Error::Slcan("serial writer poisoned".to_string()))?;
        serial.write_all(line.as_bytes())?;
        Ok(())
    }

    fn command(&self, command: &str) -> Result<()> {
        log::debug!("slcan command {command:?}");
        self.write_line(&format!("{command}\r"))
    }
}

impl FrameSender for SlcanWriter {
    fn send(&self, frame: &CanFrame) -> Result<()> {
        log::trace!("slcan send: {frame}");
        self.write_line(&encode_frame(frame))
    }
}

/// Received bytes not yet split into lines.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        if self.pending.len() > MAX_PENDING
            && !self.pending.iter().any(|b| *b == LINE_END || *b == BELL)
        {
            log::warn!(
                "Dropping {} bytes without line end, check the adapter baud rate",
                self.pending.len()
            );
            self.pending.clear();
        }
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self
            .pending
            .iter()
            .position(|b| *b == LINE_END || *b == BELL)?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        if line.pop() == Some(BELL) {
            log::warn!("slcan adapter signalled an error");
        }
        Some(line)
    }
}

pub struct SlcanBus {
    reader: Box<dyn serialport::SerialPort>,
    writer: Arc<SlcanWriter>,
    rx_buffer: LineBuffer,
}

impl SlcanBus {
    /// Opens the serial port and the CAN channel at `bitrate`.
    pub fn open(port: &str, bitrate: u32) -> Result<Self> {
        let bitrate = bitrate_command(bitrate)?;
        let reader = serialport::new(port, SERIAL_BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()?;
        let writer = Arc::new(SlcanWriter {
            serial: Mutex::new(reader.try_clone()?),
        });
        // close first, an adapter left open rejects the bitrate command
        writer.command("C")?;
        writer.command(bitrate)?;
        writer.command("O")?;
        log::info!("slcan channel on {port} opened ({bitrate})");
        Ok(Self {
            reader,
            writer,
            rx_buffer: LineBuffer::default(),
        })
    }
}

impl CanBus for SlcanBus {
    fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(line) = self.rx_buffer.next_line() {
                let line = String::from_utf8_lossy(&line);
                match decode_line(&line) {
                    Ok(Some(frame)) => return Ok(Some(frame)),
                    Ok(None) => {}
                    Err(err) => log::warn!("Dropping slcan line: {err}"),
                }
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(None);
            };
            if remaining.is_zero() {
                return Ok(None);
            }
            self.reader.set_timeout(remaining)?;
            let mut chunk = [0u8; READ_CHUNK];
            match self.reader.read(&mut chunk) {
                Ok(received) => self.rx_buffer.push(&chunk[..received]),
                Err(err) if err.kind() == ErrorKind::TimedOut => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        self.writer.send(frame)
    }

    fn sender(&self) -> Arc<dyn FrameSender> {
        self.writer.clone()
    }
}

impl Drop for SlcanBus {
    fn drop(&mut self) {
        if let Err(err) = self.writer.command("C") {
            log::warn!("Cannot close slcan channel: {err}");
        }
    }
}
