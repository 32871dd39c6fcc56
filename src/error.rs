/// Errors of the Boosted CAN protocol layer and its transports.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The payload is shorter than the message layout requires.
    #[error("Malformed payload - expected at least {expected} bytes, received {received}")]
    MalformedPayload { expected: usize, received: usize },
    /// A received CLI echo payload is not valid ASCII.
    #[error("Payload is not valid ASCII")]
    NonAscii,
    /// A command handed to the segmenter contains non-ASCII characters.
    #[error("Command {0:?} contains non-ASCII characters")]
    NonAsciiCommand(String),
    #[error("Payload of {0} bytes exceeds the 8 byte CAN limit")]
    PayloadTooLong(usize),
    #[error("Arbitration ID {0:#010X} exceeds 29 bits")]
    InvalidId(u32),
    /// A line of a can-utils log file could not be parsed.
    #[error("Cannot parse log line {line}: {reason}")]
    LogParse { line: usize, reason: String },
    /// A session configuration file could not be parsed.
    #[error("Config error: {0}")]
    Config(#[from] serde_yaml::Error),
    /// The slcan adapter answered with an error or garbage.
    #[error("slcan error: {0}")]
    Slcan(String),
    /// An I/O error, typically from the CAN adapter or a log file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// An error from the `serialport` crate.
    #[cfg(feature = "serialport")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
