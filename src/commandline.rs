use boostedcan_lib::bus::DEFAULT_BITRATE;
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::time::Duration;

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum Interface {
    /// Lawicel slcan USB adapter (CANable, CANtact, ...)
    Slcan,
    /// Linux SocketCAN network interface
    Socketcan,
}

impl Interface {
    pub fn default_channel(&self) -> &'static str {
        match self {
            Interface::Slcan if cfg!(target_os = "windows") => "COM1",
            Interface::Slcan if cfg!(target_os = "macos") => "/dev/cu.usbmodem1",
            Interface::Slcan => "/dev/ttyACM0",
            Interface::Socketcan => "can0",
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Record all bus traffic, raw and with normalized IDs, into two can-utils log files
    Log {
        /// Directory for the log files
        #[arg(short, long, default_value = ".")]
        directory: PathBuf,
    },
    /// Clear a red light of death on an XR battery (PFAILRESET followed by REBOOT)
    ResetRlod {
        /// Power the battery off once finished
        #[arg(short, long, action)]
        power_off: bool,
        /// YAML file overriding IDs and timing of the reset procedure
        #[arg(long)]
        config: Option<String>,
    },
    /// Emulate an SR battery so an ESC can be run without one
    Emulate {
        /// Reported state of charge in percent
        #[arg(long, default_value_t = 42)]
        soc: u8,
        /// Reported battery serial number (e.g. 0x00C0FFEE)
        #[arg(long, value_parser = maybe_hex::<u32>, default_value = "0x00C0FFEE")]
        serial: u32,
        /// Interval of the periodic frames (e.g. "250ms")
        #[arg(long, value_parser = humantime::parse_duration, default_value = "250ms")]
        interval: Duration,
    },
    /// Send a single command to the battery CLI and print its answer
    SendCommand {
        /// ASCII command, e.g. GETAFECELLS
        command: String,
        /// How long to listen for the answer (e.g. "2s")
        #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
        listen: Duration,
    },
    /// Print normalized arbitration IDs and their components, no adapter required
    Normalize {
        /// Arbitration IDs, decimal or hex with 0x prefix
        #[arg(required = true, value_parser = maybe_hex::<u32>)]
        ids: Vec<u32>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Dry run the RLOD reset procedure against a recorded can-utils log
    Replay {
        /// can-utils log file
        file: PathBuf,
        #[arg(short, long, action)]
        power_off: bool,
    },
}

const fn about_text() -> &'static str {
    "Boosted board CAN bus command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// CAN adapter type
    #[arg(short, long, value_enum, default_value_t = Interface::Slcan)]
    pub interface: Interface,

    /// Serial device of the slcan adapter or SocketCAN interface name
    /// (defaults to /dev/ttyACM0 for slcan and can0 for SocketCAN)
    #[arg(short, long)]
    pub channel: Option<String>,

    /// Bus bitrate, Boosted boards use 250k
    #[arg(long, default_value_t = DEFAULT_BITRATE)]
    pub bitrate: u32,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Receive poll timeout, also bounds the reaction time to Ctrl-C (e.g., "500ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "1s")]
    pub timeout: Duration,
}

impl CliArgs {
    pub fn channel(&self) -> &str {
        self.channel
            .as_deref()
            .unwrap_or_else(|| self.interface.default_channel())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_accepts_hex_and_decimal() {
        let args = CliArgs::parse_from(["boostedcan", "normalize", "0x10374204", "272056836"]);
        assert_eq!(
            args.command,
            CliCommands::Normalize {
                ids: vec![0x1037_4204, 272_056_836],
                format: OutputFormat::Text,
            }
        );
    }

    #[test]
    fn channel_defaults_per_interface() {
        let args = CliArgs::parse_from(["boostedcan", "-i", "socketcan", "emulate"]);
        assert_eq!(args.channel(), "can0");
        let args = CliArgs::parse_from(["boostedcan", "-c", "vcan0", "-i", "socketcan", "log"]);
        assert_eq!(args.channel(), "vcan0");
    }

    #[test]
    fn reset_rlod_flags() {
        let args = CliArgs::parse_from(["boostedcan", "reset-rlod", "-p", "--config", "rlod.yaml"]);
        assert_eq!(
            args.command,
            CliCommands::ResetRlod {
                power_off: true,
                config: Some("rlod.yaml".into()),
            }
        );
        assert_eq!(args.timeout, Duration::from_secs(1));
        assert_eq!(args.bitrate, 250_000);
    }
}
