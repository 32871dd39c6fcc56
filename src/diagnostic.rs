//! RLOD reset procedure for the XR battery.
//!
//! The battery is driven through its serial CLI, which is tunneled over CAN. The
//! sequence is paced by the number of received frames: the battery floods the bus
//! with roughly 250 frames per second, so 2500 frames approximate ten seconds.
//! If the bus goes quiet the sequence pauses with it.
//!
//! 1. wait for any frame, then enable message routing and start the ESC keep-alive
//! 2. let the battery boot for [`DiagnosticConfig::boot_settle_frames`]
//! 3. wait for a cell info broadcast, query the AFE cells and check the cell delta
//! 4. delta below [`DiagnosticConfig::max_cell_delta_mv`]: send `PFAILRESET`,
//!    wait, send `REBOOT`, wait
//! 5. otherwise only wait so the AFE cell dump can be read
//! 6. optionally power the battery off
//!
//! [`transition`] is the pure state machine, [`DiagnosticMachine`] adds the frame
//! clock and [`run`] drives a [`CanBus`].

use crate::bus::{CanBus, PeriodicSender};
use crate::error::{Error, Result};
use crate::protocol::{
    class_id_matches, decode_cli_echo, is_cli_echo, segment_command, Address, CanFrame,
    VoltageSample, MAX_EXTENDED_ID,
};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Clears all battery faults, RLOD included.
pub const RESET_COMMAND: &str = "PFAILRESET";
pub const REBOOT_COMMAND: &str = "REBOOT";
/// Dumps every cell voltage as measured by the AFE to the CLI.
pub const CELL_QUERY_COMMAND: &str = "GETAFECELLS";

const ROUTING_ENABLE: [u8; 1] = [0x01];
const KEEP_ALIVE: [u8; 8] = [0x00; 8];
const POWER_OFF: [u8; 8] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiagnosticConfig {
    /// Frames to wait after the first frame before cell samples are trusted.
    #[serde(default = "DiagnosticConfig::default_boot_settle_frames")]
    pub boot_settle_frames: u64,
    /// Frames to wait after `PFAILRESET` and after `REBOOT`.
    #[serde(default = "DiagnosticConfig::default_command_settle_frames")]
    pub command_settle_frames: u64,
    /// A cell delta at or above this value is not reset.
    #[serde(default = "DiagnosticConfig::default_max_cell_delta_mv")]
    pub max_cell_delta_mv: i32,
    #[serde(default = "DiagnosticConfig::default_cell_info_id")]
    pub cell_info_id: u32,
    #[serde(default = "DiagnosticConfig::default_command_base_id")]
    pub command_base_id: u32,
    #[serde(default = "DiagnosticConfig::default_routing_id")]
    pub routing_id: u32,
    #[serde(default = "DiagnosticConfig::default_keep_alive_id")]
    pub keep_alive_id: u32,
    #[serde(default = "DiagnosticConfig::default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
    /// Power the battery off once the sequence is done.
    #[serde(default)]
    pub power_off: bool,
}

impl DiagnosticConfig {
    fn default_boot_settle_frames() -> u64 {
        10 * 250
    }

    fn default_command_settle_frames() -> u64 {
        1000
    }

    // The battery itself uses a 500mV delta as the RLOD condition
    fn default_max_cell_delta_mv() -> i32 {
        500
    }

    fn default_cell_info_id() -> u32 {
        Address::CellInfo.into()
    }

    fn default_command_base_id() -> u32 {
        Address::CliCommand.into()
    }

    fn default_routing_id() -> u32 {
        Address::MessageRouting.into()
    }

    fn default_keep_alive_id() -> u32 {
        Address::KeepAlive.into()
    }

    fn default_keep_alive_interval_ms() -> u64 {
        1000
    }

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading session config from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)?;
        let config: Self = serde_yaml::from_reader(&config_file)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that all configured IDs fit into 29 bits.
    pub fn validate(&self) -> Result<()> {
        for id in [
            self.cell_info_id,
            self.command_base_id,
            self.routing_id,
            self.keep_alive_id,
        ] {
            if id > MAX_EXTENDED_ID {
                return Err(Error::InvalidId(id));
            }
        }
        Ok(())
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn routing_frame(&self) -> CanFrame {
        CanFrame::new_truncated(self.routing_id, &ROUTING_ENABLE)
    }

    pub fn keep_alive_frame(&self) -> CanFrame {
        CanFrame::new_truncated(self.keep_alive_id, &KEEP_ALIVE)
    }

    pub fn power_off_frame(&self) -> CanFrame {
        CanFrame::new_truncated(self.keep_alive_id, &POWER_OFF)
    }
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self {
            boot_settle_frames: Self::default_boot_settle_frames(),
            command_settle_frames: Self::default_command_settle_frames(),
            max_cell_delta_mv: Self::default_max_cell_delta_mv(),
            cell_info_id: Self::default_cell_info_id(),
            command_base_id: Self::default_command_base_id(),
            routing_id: Self::default_routing_id(),
            keep_alive_id: Self::default_keep_alive_id(),
            keep_alive_interval_ms: Self::default_keep_alive_interval_ms(),
            power_off: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticState {
    WaitingForFirstFrame,
    WaitingForBootSettle { start: u64 },
    AwaitingCellSample,
    /// `unrecoverable` skips the reboot, the wait only lets the CLI output drain.
    Resetting { since: u64, unrecoverable: bool },
    AwaitingRebootSettle { since: u64 },
    Exiting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send a frame as is.
    SendFrame(CanFrame),
    /// Send an ASCII command to the battery CLI.
    SendCommand(&'static str),
    /// Register the periodic ESC keep-alive.
    StartKeepAlive(CanFrame),
    /// The battery started talking.
    FirstFrame,
    BootSettled,
    CellSample(VoltageSample),
    /// The cell delta is too high for a reset to stick.
    Unrecoverable(VoltageSample),
    /// Text printed by the battery CLI.
    CliOutput(String),
    /// Stop the receive loop.
    Exit,
}

/// Advances the state machine by one received frame.
///
/// `frame_count` is the number of frames received so far including `frame`,
/// `frame` must already be normalized.
pub fn transition(
    state: DiagnosticState,
    frame_count: u64,
    frame: &CanFrame,
    config: &DiagnosticConfig,
) -> (DiagnosticState, Vec<Effect>) {
    use DiagnosticState::*;

    let mut effects = Vec::new();
    let elapsed = |since: u64| frame_count.saturating_sub(since);

    // the frame crossing the boot threshold already counts as a sample candidate
    let state = match state {
        WaitingForBootSettle { start } if elapsed(start) > config.boot_settle_frames => {
            effects.push(Effect::BootSettled);
            AwaitingCellSample
        }
        other => other,
    };

    let next = match state {
        Exiting => return (Exiting, effects),
        WaitingForFirstFrame => {
            effects.push(Effect::FirstFrame);
            effects.push(Effect::SendFrame(config.routing_frame()));
            effects.push(Effect::StartKeepAlive(config.keep_alive_frame()));
            WaitingForBootSettle { start: frame_count }
        }
        AwaitingCellSample if class_id_matches(frame.id(), config.cell_info_id) => {
            evaluate_cell_sample(frame, frame_count, config, &mut effects)
        }
        Resetting {
            since,
            unrecoverable,
        } if elapsed(since) > config.command_settle_frames => {
            if unrecoverable {
                Exiting
            } else {
                effects.push(Effect::SendCommand(REBOOT_COMMAND));
                AwaitingRebootSettle { since: frame_count }
            }
        }
        AwaitingRebootSettle { since } if elapsed(since) > config.command_settle_frames => Exiting,
        other => other,
    };

    if next == Exiting {
        if config.power_off {
            effects.push(Effect::SendFrame(config.power_off_frame()));
        }
        effects.push(Effect::Exit);
    } else if is_cli_echo(frame.id()) {
        match decode_cli_echo(frame.data()) {
            Ok(text) => effects.push(Effect::CliOutput(text.to_string())),
            Err(err) => log::trace!("Discarding CLI output {frame}: {err}"),
        }
    }
    (next, effects)
}

fn evaluate_cell_sample(
    frame: &CanFrame,
    frame_count: u64,
    config: &DiagnosticConfig,
    effects: &mut Vec<Effect>,
) -> DiagnosticState {
    let sample = match VoltageSample::decode(frame.data()) {
        Ok(sample) => sample,
        Err(err) => {
            log::warn!("Skipping cell info frame {frame}: {err}");
            return DiagnosticState::AwaitingCellSample;
        }
    };
    log::debug!("Cell sample at frame {frame_count}: {sample:?}");
    effects.push(Effect::SendCommand(CELL_QUERY_COMMAND));
    effects.push(Effect::CellSample(sample));

    // the CAN summary can miss a cell that is far out of spec, the
    // GETAFECELLS dump is the authoritative view
    let unrecoverable = sample.delta_mv() >= config.max_cell_delta_mv;
    if unrecoverable {
        effects.push(Effect::Unrecoverable(sample));
    } else {
        effects.push(Effect::SendCommand(RESET_COMMAND));
    }
    DiagnosticState::Resetting {
        since: frame_count,
        unrecoverable,
    }
}

/// [`transition`] plus the frame clock.
#[derive(Debug)]
pub struct DiagnosticMachine {
    config: DiagnosticConfig,
    state: DiagnosticState,
    frames_seen: u64,
    sample: Option<VoltageSample>,
}

impl DiagnosticMachine {
    pub fn new(config: DiagnosticConfig) -> Self {
        Self {
            config,
            state: DiagnosticState::WaitingForFirstFrame,
            frames_seen: 0,
            sample: None,
        }
    }

    pub fn config(&self) -> &DiagnosticConfig {
        &self.config
    }

    pub fn state(&self) -> DiagnosticState {
        self.state
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// The cell sample the decision was based on.
    pub fn sample(&self) -> Option<VoltageSample> {
        self.sample
    }

    pub fn is_finished(&self) -> bool {
        self.state == DiagnosticState::Exiting
    }

    pub fn on_frame(&mut self, frame: &CanFrame) -> Vec<Effect> {
        if self.is_finished() {
            return Vec::new();
        }
        self.frames_seen += 1;
        let (state, effects) =
            transition(self.state, self.frames_seen, &frame.normalized(), &self.config);
        if state != self.state {
            log::debug!(
                "Frame {}: {:?} -> {:?}",
                self.frames_seen,
                self.state,
                state
            );
        }
        for effect in &effects {
            if let Effect::CellSample(sample) = effect {
                self.sample = Some(*sample);
            }
        }
        self.state = state;
        effects
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `PFAILRESET` and `REBOOT` were sent.
    Reset,
    /// The cell delta was too high, nothing was reset.
    Unrecoverable,
    Cancelled,
    /// The bus can not deliver any more frames, e.g. a finished recording.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub outcome: Outcome,
    pub frames_seen: u64,
    pub sample: Option<VoltageSample>,
}

/// Sends an ASCII command to the battery's CLI.
pub fn send_command<B: CanBus + ?Sized>(bus: &mut B, command: &str, base: u32) -> Result<()> {
    log::info!("Sending command {command:?}");
    for segment in segment_command(command, base)? {
        bus.send(&segment.to_frame()?)?;
    }
    Ok(())
}

/// Runs the reset procedure on `bus` until it completes or `cancel` is set.
///
/// Every effect is handed to `observe` after it was carried out. The
/// keep-alive is stopped on every exit path.
pub fn run<B, F>(
    bus: &mut B,
    config: DiagnosticConfig,
    poll_timeout: Duration,
    cancel: &AtomicBool,
    mut observe: F,
) -> Result<SessionReport>
where
    B: CanBus + ?Sized,
    F: FnMut(&Effect),
{
    let mut machine = DiagnosticMachine::new(config);
    let mut keep_alive: Option<PeriodicSender> = None;
    let mut reset_sent = false;

    let outcome = 'session: loop {
        if cancel.load(Ordering::Relaxed) {
            log::info!("Session cancelled after {} frames", machine.frames_seen());
            if machine.config().power_off {
                bus.send(&machine.config().power_off_frame())?;
            }
            break Outcome::Cancelled;
        }
        let Some(frame) = bus.recv(poll_timeout)? else {
            if bus.is_exhausted() {
                log::warn!("Bus exhausted in state {:?}", machine.state());
                break Outcome::Exhausted;
            }
            continue;
        };
        for effect in machine.on_frame(&frame) {
            match &effect {
                Effect::SendFrame(frame) => bus.send(frame)?,
                Effect::SendCommand(command) => {
                    send_command(bus, command, machine.config().command_base_id)?;
                    reset_sent |= *command == RESET_COMMAND;
                }
                Effect::StartKeepAlive(frame) => {
                    keep_alive = Some(PeriodicSender::start(
                        bus.sender(),
                        *frame,
                        machine.config().keep_alive_interval(),
                    ));
                }
                _ => {}
            }
            observe(&effect);
            if effect == Effect::Exit {
                let outcome = if reset_sent {
                    Outcome::Reset
                } else {
                    Outcome::Unrecoverable
                };
                break 'session outcome;
            }
        }
    };

    if let Some(keep_alive) = keep_alive {
        keep_alive.stop();
    }
    Ok(SessionReport {
        outcome,
        frames_seen: machine.frames_seen(),
        sample: machine.sample(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::normalize;

    fn filler() -> CanFrame {
        CanFrame::new(0x1037_4204, &[0x11, 0x22]).unwrap()
    }

    fn cell_info(lowest_mv: u16, highest_mv: u16) -> CanFrame {
        let sample = VoltageSample {
            lowest_mv,
            highest_mv,
            total_mv: 39_867,
        };
        // rolling code and long command set, like on the wire
        CanFrame::new(0x1033_4457, &sample.encode()).unwrap()
    }

    fn commands(effects: &[Effect]) -> Vec<&'static str> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::SendCommand(command) => Some(*command),
                _ => None,
            })
            .collect()
    }

    fn settled_machine() -> DiagnosticMachine {
        let mut machine = DiagnosticMachine::new(DiagnosticConfig::default());
        for _ in 0..2502 {
            machine.on_frame(&filler());
        }
        assert_eq!(machine.state(), DiagnosticState::AwaitingCellSample);
        machine
    }

    #[test]
    fn first_frame_enables_routing_and_keep_alive() {
        let config = DiagnosticConfig::default();
        let (state, effects) = transition(
            DiagnosticState::WaitingForFirstFrame,
            1,
            &filler().normalized(),
            &config,
        );
        assert_eq!(state, DiagnosticState::WaitingForBootSettle { start: 1 });
        assert!(effects.contains(&Effect::SendFrame(
            CanFrame::new(0x1034_6090, &[0x01]).unwrap()
        )));
        assert!(effects.contains(&Effect::StartKeepAlive(
            CanFrame::new(0x1034_34B0, &[0; 8]).unwrap()
        )));
    }

    #[test]
    fn boot_settle_is_counted_in_frames() {
        let config = DiagnosticConfig::default();
        let waiting = DiagnosticState::WaitingForBootSettle { start: 1 };
        let (state, _) = transition(waiting, 2501, &filler(), &config);
        assert_eq!(state, waiting);
        let (state, effects) = transition(waiting, 2502, &filler(), &config);
        assert_eq!(state, DiagnosticState::AwaitingCellSample);
        assert_eq!(effects, vec![Effect::BootSettled]);
    }

    #[test]
    fn cell_info_before_boot_settle_is_ignored() {
        let mut machine = DiagnosticMachine::new(DiagnosticConfig::default());
        machine.on_frame(&filler());
        let effects = machine.on_frame(&cell_info(3120, 3131));
        assert!(commands(&effects).is_empty());
        assert_eq!(
            machine.state(),
            DiagnosticState::WaitingForBootSettle { start: 1 }
        );
    }

    #[test]
    fn threshold_crossing_frame_is_evaluated() {
        let mut machine = DiagnosticMachine::new(DiagnosticConfig::default());
        for _ in 0..2501 {
            machine.on_frame(&filler());
        }
        let effects = machine.on_frame(&cell_info(3120, 3131));
        assert_eq!(effects[0], Effect::BootSettled);
        assert_eq!(commands(&effects), vec![CELL_QUERY_COMMAND, RESET_COMMAND]);
    }

    #[test]
    fn delta_499_is_reset() {
        let mut machine = settled_machine();
        let effects = machine.on_frame(&cell_info(3000, 3499));
        assert_eq!(commands(&effects), vec![CELL_QUERY_COMMAND, RESET_COMMAND]);
        assert_eq!(
            machine.state(),
            DiagnosticState::Resetting {
                since: 2503,
                unrecoverable: false
            }
        );
    }

    #[test]
    fn delta_500_is_not_reset() {
        let mut machine = settled_machine();
        let effects = machine.on_frame(&cell_info(3000, 3500));
        assert_eq!(commands(&effects), vec![CELL_QUERY_COMMAND]);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Unrecoverable(s) if s.delta_mv() == 500)));
        assert_eq!(
            machine.state(),
            DiagnosticState::Resetting {
                since: 2503,
                unrecoverable: true
            }
        );
    }

    #[test]
    fn malformed_cell_info_is_skipped() {
        let mut machine = settled_machine();
        let effects = machine.on_frame(&CanFrame::new(0x1003_4451, &[0x30, 0x0C]).unwrap());
        assert!(effects.is_empty());
        assert_eq!(machine.state(), DiagnosticState::AwaitingCellSample);
        let effects = machine.on_frame(&cell_info(3120, 3131));
        assert_eq!(commands(&effects), vec![CELL_QUERY_COMMAND, RESET_COMMAND]);
    }

    #[test]
    fn reboot_follows_after_settle_window() {
        let mut machine = settled_machine();
        machine.on_frame(&cell_info(3120, 3131));
        let reset_at = machine.frames_seen();
        let mut reboot_at = None;
        let mut exit_at = None;
        while !machine.is_finished() {
            let effects = machine.on_frame(&filler());
            if commands(&effects) == vec![REBOOT_COMMAND] {
                assert!(reboot_at.is_none(), "REBOOT sent twice");
                reboot_at = Some(machine.frames_seen());
            }
            if effects.contains(&Effect::Exit) {
                exit_at = Some(machine.frames_seen());
            }
        }
        assert_eq!(reboot_at, Some(reset_at + 1001));
        assert_eq!(exit_at, Some(reset_at + 2002));
    }

    #[test]
    fn unrecoverable_exits_after_one_window_without_reboot() {
        let mut machine = settled_machine();
        machine.on_frame(&cell_info(2500, 3400));
        let sample_at = machine.frames_seen();
        let mut sent = Vec::new();
        while !machine.is_finished() {
            sent.extend(commands(&machine.on_frame(&filler())));
        }
        assert!(sent.is_empty());
        assert_eq!(machine.frames_seen(), sample_at + 1001);
        assert_eq!(machine.on_frame(&filler()), Vec::new());
    }

    #[test]
    fn power_off_is_sent_on_exit_when_configured() {
        let config = DiagnosticConfig {
            power_off: true,
            ..Default::default()
        };
        let state = DiagnosticState::AwaitingRebootSettle { since: 10 };
        let (state, effects) = transition(state, 1011, &filler(), &config);
        assert_eq!(state, DiagnosticState::Exiting);
        assert_eq!(
            effects,
            vec![
                Effect::SendFrame(
                    CanFrame::new(0x1034_34B0, &[0x02, 0, 0, 0, 0, 0, 0, 0]).unwrap()
                ),
                Effect::Exit
            ]
        );
    }

    #[test]
    fn cli_echo_is_forwarded_in_any_state() {
        let config = DiagnosticConfig::default();
        let echo = CanFrame::new(normalize(0x1034_4113), b"Cell 1: ").unwrap();
        for state in [
            DiagnosticState::WaitingForBootSettle { start: 1 },
            DiagnosticState::AwaitingCellSample,
            DiagnosticState::Resetting {
                since: 5,
                unrecoverable: true,
            },
        ] {
            let (next, effects) = transition(state, 6, &echo, &config);
            assert_eq!(next, state);
            assert_eq!(effects, vec![Effect::CliOutput("Cell 1: ".to_string())]);
        }
    }

    #[test]
    fn non_ascii_cli_echo_is_discarded() {
        let config = DiagnosticConfig::default();
        let echo = CanFrame::new(0x1034_4110, &[0xC3, 0xA9]).unwrap();
        let (next, effects) = transition(DiagnosticState::AwaitingCellSample, 3000, &echo, &config);
        assert_eq!(next, DiagnosticState::AwaitingCellSample);
        assert!(effects.is_empty());
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: DiagnosticConfig =
            serde_yaml::from_str("max_cell_delta_mv: 300\npower_off: true\n").unwrap();
        assert_eq!(config.max_cell_delta_mv, 300);
        assert!(config.power_off);
        assert_eq!(config.boot_settle_frames, 2500);
        assert_eq!(config.cell_info_id, 0x1003_4450);
        assert!(serde_yaml::from_str::<DiagnosticConfig>("unknown: 1\n").is_err());
    }

    #[test]
    fn config_rejects_ids_above_29_bits() {
        let config = DiagnosticConfig {
            routing_id: 0x2000_0000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidId(0x2000_0000))));
        assert!(DiagnosticConfig::default().validate().is_ok());
    }
}
