#![cfg_attr(docsrs, feature(doc_cfg))]
//! # boostedcan_lib
//!
//! Talks to the CAN bus of Boosted boards: XR and SR batteries and the ESC.
//!
//! The protocol layer (address normalization, CLI command segmentation,
//! voltage decoding) is plain data manipulation. Everything that touches a bus
//! goes through the [`bus::CanBus`] trait, so the recorder, the RLOD reset
//! procedure and the battery emulator run against real adapters as well as
//! against recorded logs.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `boostedcan` command-line tool.
//!
//! ### Adapter Features
//! - `serialport`: Enables the slcan adapter (CANable and other Lawicel style USB dongles).
//! - `socketcan`: Enables the Linux SocketCAN adapter.
//!
//! ### Utility Features
//! - `protocol_serde`: Enables `serde` serialization of the address components.
//! - `bin-dependencies`: Enables all features required by the `boostedcan` binary executable.

mod error;
/// Address codec, command segmenter and voltage decoder.
pub mod protocol;

pub use error::{Error, Result};

/// Transport abstraction and the periodic sender.
pub mod bus;
/// can-utils text log reader and writer.
pub mod canlog;
/// RLOD reset procedure for XR batteries.
pub mod diagnostic;
/// SR battery emulator.
pub mod emulator;
/// Dual stream bus recorder.
pub mod recorder;

/// slcan adapter over a serial port.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod slcan;

/// SocketCAN adapter.
#[cfg_attr(docsrs, doc(cfg(all(target_os = "linux", feature = "socketcan"))))]
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;
