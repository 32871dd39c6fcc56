use crate::error::{Error, Result};
use std::fmt;

#[cfg(feature = "protocol_serde")]
use serde::Serialize;

/// Well known (normalized) arbitration IDs of the XR battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Address {
    /// Lowest cell, highest cell and total pack millivolts broadcast by the battery.
    CellInfo = 0x1003_4450,
    /// Base address of the battery's serial CLI, long command nibble already at 2.
    CliCommand = 0x1024_6110,
    /// Enables the routing of battery messages to the CAN bus.
    MessageRouting = 0x1034_6090,
    /// ESC keep-alive, also carries the power-off request.
    KeepAlive = 0x1034_34B0,
}

impl From<Address> for u32 {
    fn from(address: Address) -> u32 {
        address as u32
    }
}

/// Clears the long command nibble and the rolling code nibble.
pub const NORMALIZE_MASK: u32 = 0xFF0F_FFF0;
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
pub const MAX_PAYLOAD_LENGTH: usize = 8;

const ROLLING_CODE_MASK: u32 = 0x0000_000F;
const LONG_COMMAND_SHIFT: u32 = 20;
const LONG_COMMAND_MASK: u32 = 0x00F0_0000;
const LONG_COMMAND_STEP: u32 = 1 << LONG_COMMAND_SHIFT;

// Battery CLI output, matched on the normalized ID: 0x???????11?
const CLI_ECHO_MASK: u32 = 0x0000_0FF0;
const CLI_ECHO_PATTERN: u32 = 0x0000_0110;

/// The long command sequence counts down from 2 to 0, so longer commands
/// start to borrow from the class ID.
pub const MAX_COMMAND_SEGMENTS: usize = 3;
const COMMAND_TERMINATOR: &str = "\r\n";

pub fn normalize(id: u32) -> u32 {
    id & NORMALIZE_MASK
}

pub fn class_id_matches(normalized_id: u32, target_id: u32) -> bool {
    normalized_id == target_id
}

/// Returns true if the frame carries output of the battery's serial CLI.
pub fn is_cli_echo(id: u32) -> bool {
    normalize(id) & CLI_ECHO_MASK == CLI_ECHO_PATTERN
}

/// Decodes the payload of a CLI echo frame.
pub fn decode_cli_echo(data: &[u8]) -> Result<&str> {
    if !data.is_ascii() {
        return Err(Error::NonAscii);
    }
    std::str::from_utf8(data).map_err(|_| Error::NonAscii)
}

fn validate_len(buffer: &[u8], size: usize) -> Result<()> {
    if buffer.len() < size {
        log::warn!(
            "Invalid payload size - required={} received={}",
            size,
            buffer.len()
        );
        return Err(Error::MalformedPayload {
            expected: size,
            received: buffer.len(),
        });
    }
    Ok(())
}

/// The structural parts of a Boosted arbitration ID.
///
/// ```text
///  0x10374200
///           ^ rolling code, 0-F, incremented by the sender on every frame
///       ^^^^  source, destination, channel
///      ^      long command, 3 for single frames, counting down for multi frame commands
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct AddressComponents {
    pub rolling_code: u8,
    pub long_command: u8,
    pub class_id: u32,
}

impl AddressComponents {
    pub fn split(id: u32) -> Self {
        Self {
            rolling_code: (id & ROLLING_CODE_MASK) as u8,
            long_command: ((id & LONG_COMMAND_MASK) >> LONG_COMMAND_SHIFT) as u8,
            class_id: normalize(id),
        }
    }

    pub fn join(&self) -> u32 {
        normalize(self.class_id)
            | ((u32::from(self.long_command) << LONG_COMMAND_SHIFT) & LONG_COMMAND_MASK)
            | (u32::from(self.rolling_code) & ROLLING_CODE_MASK)
    }
}

/// An extended (29 bit) CAN data frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    data: [u8; MAX_PAYLOAD_LENGTH],
    len: u8,
}

impl CanFrame {
    pub fn new(id: u32, data: &[u8]) -> Result<Self> {
        if id > MAX_EXTENDED_ID {
            return Err(Error::InvalidId(id));
        }
        if data.len() > MAX_PAYLOAD_LENGTH {
            return Err(Error::PayloadTooLong(data.len()));
        }
        let mut buffer = [0; MAX_PAYLOAD_LENGTH];
        buffer[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            data: buffer,
            len: data.len() as u8,
        })
    }

    /// Like [`CanFrame::new`], but masks the ID to 29 bits and cuts the payload after 8 bytes.
    pub fn new_truncated(id: u32, data: &[u8]) -> Self {
        let len = data.len().min(MAX_PAYLOAD_LENGTH);
        let mut buffer = [0; MAX_PAYLOAD_LENGTH];
        buffer[..len].copy_from_slice(&data[..len]);
        Self {
            id: id & MAX_EXTENDED_ID,
            data: buffer,
            len: len as u8,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }

    /// A copy of this frame with the long command and rolling code cleared.
    pub fn normalized(&self) -> Self {
        Self {
            id: normalize(self.id),
            ..*self
        }
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanFrame({self})")
    }
}

/// can-utils notation, e.g. `10374200#01A2`.
impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}#", self.id)?;
        for byte in self.data() {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// One frame worth of a CLI command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub id: u32,
    pub bytes: Vec<u8>,
}

impl Segment {
    pub fn to_frame(&self) -> Result<CanFrame> {
        CanFrame::new(self.id, &self.bytes)
    }
}

/// Splits an ASCII command for the battery CLI into CAN frame sized segments.
///
/// The command is terminated with CR LF and cut into 8 byte chunks. A command
/// fitting into a single frame is sent with the long command nibble one above
/// `base`. Multi frame commands start at `base` and count the long command
/// nibble down for every chunk while the rolling code counts up, the firmware
/// uses the nibble reaching zero to detect the last chunk.
pub fn segment_command(command: &str, base: u32) -> Result<Vec<Segment>> {
    if !command.is_ascii() {
        return Err(Error::NonAsciiCommand(command.to_string()));
    }
    let mut bytes = Vec::with_capacity(command.len() + COMMAND_TERMINATOR.len());
    bytes.extend_from_slice(command.as_bytes());
    bytes.extend_from_slice(COMMAND_TERMINATOR.as_bytes());

    let base = if bytes.len() <= MAX_PAYLOAD_LENGTH {
        base.wrapping_add(LONG_COMMAND_STEP)
    } else {
        base
    };

    let segments: Vec<Segment> = bytes
        .chunks(MAX_PAYLOAD_LENGTH)
        .enumerate()
        .map(|(index, chunk)| {
            let section = index as u32;
            Segment {
                index,
                id: base
                    .wrapping_sub(section.wrapping_mul(LONG_COMMAND_STEP))
                    .wrapping_add(section),
                bytes: chunk.to_vec(),
            }
        })
        .collect();

    if segments.len() > MAX_COMMAND_SEGMENTS {
        log::warn!(
            "Command {:?} needs {} segments, the long command nibble underflows after {}",
            command,
            segments.len(),
            MAX_COMMAND_SEGMENTS
        );
    }
    log::trace!("segment_command {command:?}: {segments:02X?}");
    Ok(segments)
}

/// Cell voltage summary as broadcast on [`Address::CellInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct VoltageSample {
    pub lowest_mv: u16,
    pub highest_mv: u16,
    pub total_mv: u16,
}

impl VoltageSample {
    pub fn payload_size() -> usize {
        6
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        validate_len(payload, Self::payload_size())?;
        Ok(Self {
            lowest_mv: u16::from_le_bytes([payload[0], payload[1]]),
            highest_mv: u16::from_le_bytes([payload[2], payload[3]]),
            total_mv: u16::from_le_bytes([payload[4], payload[5]]),
        })
    }

    pub fn encode(&self) -> [u8; MAX_PAYLOAD_LENGTH] {
        let lowest = self.lowest_mv.to_le_bytes();
        let highest = self.highest_mv.to_le_bytes();
        let total = self.total_mv.to_le_bytes();
        [
            lowest[0], lowest[1], highest[0], highest[1], total[0], total[1], 0x00, 0x00,
        ]
    }

    /// Highest minus lowest cell. Negative values point to a decoding or hardware problem.
    pub fn delta_mv(&self) -> i32 {
        i32::from(self.highest_mv) - i32::from(self.lowest_mv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(segments: &[Segment]) -> String {
        let bytes: Vec<u8> = segments.iter().flat_map(|s| s.bytes.clone()).collect();
        let text = String::from_utf8(bytes).unwrap();
        text.strip_suffix("\r\n").unwrap().to_string()
    }

    #[test]
    fn normalize_clears_rolling_code_and_long_command() {
        assert_eq!(normalize(0x1037_4200), 0x1007_4200);
        assert_eq!(normalize(0x1037_4204), normalize(0x1037_4200));
        assert_eq!(normalize(0x1023_4171), 0x1003_4170);
    }

    #[test]
    fn normalize_is_idempotent() {
        for id in [0u32, 0x1037_4204, 0x0B57_ED10, 0x1FFF_FFFF, u32::MAX, 0x00F0_000F] {
            assert_eq!(normalize(normalize(id)), normalize(id));
        }
    }

    #[test]
    fn components_split_and_join() {
        let components = AddressComponents::split(0x1037_4204);
        assert_eq!(components.rolling_code, 4);
        assert_eq!(components.long_command, 3);
        assert_eq!(components.class_id, 0x1007_4200);
        assert_eq!(components.join(), 0x1037_4204);
    }

    #[test]
    fn cli_echo_is_detected_on_any_rolling_code() {
        assert!(is_cli_echo(0x1034_4113));
        assert!(is_cli_echo(0x1004_4110));
        assert!(!is_cli_echo(Address::CellInfo.into()));
        assert_eq!(decode_cli_echo(b"Cell 1: ").unwrap(), "Cell 1: ");
        assert!(matches!(decode_cli_echo(&[0x41, 0xFF]), Err(Error::NonAscii)));
    }

    #[test]
    fn frame_bounds_are_checked() {
        assert!(matches!(
            CanFrame::new(0x10, &[0; 9]),
            Err(Error::PayloadTooLong(9))
        ));
        assert!(matches!(
            CanFrame::new(0x2000_0000, &[]),
            Err(Error::InvalidId(0x2000_0000))
        ));
        let frame = CanFrame::new(0x1037_4204, &[0x01, 0xA2]).unwrap();
        assert_eq!(frame.to_string(), "10374204#01A2");
        assert_eq!(frame.normalized().id(), 0x1007_4200);
        assert_eq!(frame.id(), 0x1037_4204);
        assert_eq!(frame.normalized().data(), frame.data());
        let truncated = CanFrame::new_truncated(0xF037_4204, &[7; 10]);
        assert_eq!(truncated.id(), 0x1037_4204);
        assert_eq!(truncated.data(), &[7; 8][..]);
    }

    #[test]
    fn single_frame_command_uses_sentinel_nibble() {
        let segments = segment_command("REBOOT", Address::CliCommand.into()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].id, 0x1034_6110);
        assert_eq!(AddressComponents::split(segments[0].id).long_command, 3);
        assert_eq!(segments[0].bytes, b"REBOOT\r\n");
    }

    #[test]
    fn multi_frame_command_counts_nibble_down() {
        let command = "ABCDEFGHIJKLMNOPQ";
        assert_eq!(command.len(), 17);
        let segments = segment_command(command, Address::CliCommand.into()).unwrap();
        assert_eq!(segments.len(), 3);
        let nibbles: Vec<u8> = segments
            .iter()
            .map(|s| AddressComponents::split(s.id).long_command)
            .collect();
        assert_eq!(nibbles, vec![2, 1, 0]);
        let offsets: Vec<u8> = segments
            .iter()
            .map(|s| AddressComponents::split(s.id).rolling_code)
            .collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(segments[0].id, 0x1024_6110);
        assert_eq!(segments[1].id, 0x1014_6111);
        assert_eq!(segments[2].id, 0x1004_6112);
    }

    #[test]
    fn segmentation_reassembles_around_chunk_boundaries() {
        for len in [0usize, 7, 8, 9, 16, 17] {
            let command: String = "PFAILRESETGETAFECELLS".chars().cycle().take(len).collect();
            let segments = segment_command(&command, Address::CliCommand.into()).unwrap();
            assert!(segments.iter().all(|s| s.bytes.len() <= MAX_PAYLOAD_LENGTH));
            assert!(segments.iter().enumerate().all(|(i, s)| s.index == i));
            assert_eq!(reassemble(&segments), command, "length {len}");
        }
    }

    #[test]
    fn six_byte_command_still_fits_a_single_frame() {
        // "PFAIL" + CR LF = 7 bytes, "PFAILRE" + CR LF = 9 bytes
        let single = segment_command("PFAIL", Address::CliCommand.into()).unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].id, 0x1034_6110);
        let double = segment_command("PFAILRE", Address::CliCommand.into()).unwrap();
        assert_eq!(double.len(), 2);
        assert_eq!(double[0].id, 0x1024_6110);
        assert_eq!(double[1].bytes, b"\n");
    }

    #[test]
    fn non_ascii_command_is_rejected() {
        assert!(matches!(
            segment_command("RESET\u{e9}", Address::CliCommand.into()),
            Err(Error::NonAsciiCommand(_))
        ));
    }

    #[test]
    fn voltage_sample_decode() {
        let sample =
            VoltageSample::decode(&[0x30, 0x0C, 0x3B, 0x0C, 0xBB, 0x9B, 0x00, 0x00]).unwrap();
        assert_eq!(sample.lowest_mv, 3120);
        assert_eq!(sample.highest_mv, 3131);
        assert_eq!(sample.total_mv, 39867);
        assert_eq!(sample.delta_mv(), 11);
        assert_eq!(sample.encode(), [0x30, 0x0C, 0x3B, 0x0C, 0xBB, 0x9B, 0x00, 0x00]);
    }

    #[test]
    fn voltage_sample_short_payload() {
        assert!(matches!(
            VoltageSample::decode(&[0x30, 0x0C, 0x3B, 0x0C, 0xBB]),
            Err(Error::MalformedPayload {
                expected: 6,
                received: 5
            })
        ));
        // reserved bytes are optional
        assert!(VoltageSample::decode(&[0x30, 0x0C, 0x3B, 0x0C, 0xBB, 0x9B]).is_ok());
    }

    #[test]
    fn negative_delta_is_not_masked() {
        let sample = VoltageSample {
            lowest_mv: 3300,
            highest_mv: 3200,
            total_mv: 0,
        };
        assert_eq!(sample.delta_mv(), -100);
    }
}
