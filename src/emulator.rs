//! Pretends to be enough of an SR battery for the ESC to engage the motors.
//!
//! Only the happy path messages are sent. The ESC trusts the reported state of
//! charge, so never drive a real pack with made up values.

use crate::bus::{CanBus, PeriodicSender};
use crate::error::Result;
use crate::protocol::{CanFrame, VoltageSample};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const FIRMWARE_ID: u32 = 0x0B57_ED00;
const SERIAL_ID: u32 = 0x0B57_ED01;
const MOTOR_ID: u32 = 0x0B57_ED02;
const UNKNOWN_ID: u32 = 0x0B57_ED03;
const CELL_INFO_ID: u32 = 0x0B57_ED10;
const LEVEL_ID: u32 = 0x0B57_ED14;
const CHARGE_ID: u32 = 0x0B57_ED15;

// major, minor, revision, unknown
const FIRMWARE: [u8; 8] = [0x01, 0x04, 0x01, 0x33, 0x66, 0x34, 0x35, 0x31];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorConfig {
    pub serial: u32,
    /// LiFePO4 cell and pack voltages.
    pub voltages: VoltageConfig,
    pub soc_percent: u8,
    pub interval_ms: u64,
    /// Pause between the first ESC frame and the one shot frames.
    pub startup_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoltageConfig {
    pub lowest_mv: u16,
    pub highest_mv: u16,
    pub total_mv: u16,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            serial: 0x00C0_FFEE,
            voltages: VoltageConfig {
                lowest_mv: 3312,
                highest_mv: 3323,
                total_mv: 39_867,
            },
            soc_percent: 42,
            interval_ms: 250,
            startup_delay_ms: 250,
        }
    }
}

impl EmulatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    fn sample(&self) -> VoltageSample {
        VoltageSample {
            lowest_mv: self.voltages.lowest_mv,
            highest_mv: self.voltages.highest_mv,
            total_mv: self.voltages.total_mv,
        }
    }

    /// Firmware version, serial number and one unknown frame, sent once.
    pub fn one_shot_frames(&self) -> Vec<CanFrame> {
        let serial = self.serial.to_le_bytes();
        vec![
            CanFrame::new_truncated(FIRMWARE_ID, &FIRMWARE),
            CanFrame::new_truncated(
                SERIAL_ID,
                &[serial[0], serial[1], serial[2], serial[3], 0xF7, 0x8A, 0x01, 0x01],
            ),
            CanFrame::new_truncated(
                UNKNOWN_ID,
                &[0xD2, 0x0F, 0xCA, 0x08, 0x0C, 0x00, 0x00, 0x00],
            ),
        ]
    }

    /// Frames the ESC expects every interval.
    pub fn cyclic_frames(&self) -> Vec<CanFrame> {
        let soc = if self.soc_percent > 100 {
            log::warn!("SOC of {}% clamped to 100%", self.soc_percent);
            100
        } else {
            self.soc_percent
        };
        vec![
            CanFrame::new_truncated(MOTOR_ID, &[0x00, 0x00, 0xC4, 0x09, 0x00, 0x00, 0x00, 0x00]),
            CanFrame::new_truncated(CELL_INFO_ID, &self.sample().encode()),
            CanFrame::new_truncated(LEVEL_ID, &[0x9B, 0x07, 0xC4, 0x09, soc, 0x00, 0x05, 0x00]),
            CanFrame::new_truncated(CHARGE_ID, &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x7F, 0x00]),
        ]
    }
}

/// Waits for the ESC, then emulates the battery until `cancel` is set or the bus is exhausted.
///
/// Returns the number of frames received from the ESC.
pub fn run<B>(
    bus: &mut B,
    config: &EmulatorConfig,
    poll_timeout: Duration,
    cancel: &AtomicBool,
) -> Result<u64>
where
    B: CanBus + ?Sized,
{
    let mut received = 0u64;
    log::info!("Waiting on a message from the ESC");
    while received == 0 {
        if cancel.load(Ordering::Relaxed) {
            return Ok(received);
        }
        match bus.recv(poll_timeout)? {
            Some(_) => received += 1,
            None if bus.is_exhausted() => return Ok(received),
            None => {}
        }
    }
    std::thread::sleep(Duration::from_millis(config.startup_delay_ms));

    log::info!("Got a CAN message, starting simulation");
    for frame in config.one_shot_frames() {
        bus.send(&frame)?;
    }
    let _cyclic: Vec<PeriodicSender> = config
        .cyclic_frames()
        .into_iter()
        .map(|frame| PeriodicSender::start(bus.sender(), frame, config.interval()))
        .collect();

    while !cancel.load(Ordering::Relaxed) {
        match bus.recv(poll_timeout)? {
            Some(frame) => {
                received += 1;
                log::trace!("ESC: {frame}");
            }
            None if bus.is_exhausted() => break,
            None => {}
        }
    }
    log::info!("Simulation stopped after {received} ESC frames");
    Ok(received)
}
