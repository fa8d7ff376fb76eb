//! Hyperload frame tokens and their byte encodings.
//!
//! All functions here are pure; no I/O happens in this module.

use byteorder::{ByteOrder, LittleEndian};

/// Sync byte sent by the bootloader after reset.
pub const SYNC: u8 = 0xFF;

/// First handshake acknowledgement (host to device).
pub const ACK_STEP1: u8 = 0x55;

/// Second handshake acknowledgement / device id (device to host).
pub const ACK_STEP2: u8 = 0xAA;

/// First character of the board descriptor line.
pub const DESC_START: u8 = b'$';

/// Ready / block accepted.
pub const OK: u8 = b'!';

/// Acknowledgement of the end-of-transmission marker.
pub const FINAL_ACK: u8 = b'*';

/// Descriptor line terminator.
pub const LINE_END: u8 = b'\n';

/// Descriptor field separator.
pub const FIELD_SEPARATOR: u8 = b':';

/// End-of-transmission marker sent after the last block.
pub const END_OF_TRANSMISSION: [u8; 2] = [0xFF, 0xFF];

/// Compute the control word for `baud_rate` on a CPU clocked at `clock_hz`.
///
/// `floor(clock_hz / (baud_rate * 16)) - 1`. Correct operation assumes
/// `baud_rate * 16 <= clock_hz`; a smaller clock yields `-1`.
///
/// # Panics
///
/// Panics if `baud_rate` is zero. [`SessionConfig::validate`] rejects that
/// configuration before a session starts.
///
/// [`SessionConfig::validate`]: crate::session::SessionConfig::validate
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn control_word(clock_hz: u32, baud_rate: u32) -> i32 {
    let divisor = u64::from(baud_rate) * 16;
    (u64::from(clock_hz) / divisor) as i32 - 1
}

/// Encode a control word as 4 little-endian bytes.
#[must_use]
pub fn encode_control_word(value: i32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    LittleEndian::write_i32(&mut buf, value);
    buf
}

/// Encode a block index as transmitted: low byte first, then high byte.
#[must_use]
pub fn encode_block_index(index: u16) -> [u8; 2] {
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, index);
    buf
}

/// Block checksum: sum of all bytes modulo 256.
///
/// An empty slice has checksum `0`.
#[must_use]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_word_48mhz_38400() {
        assert_eq!(control_word(48_000_000, 38_400), 77);
    }

    #[test]
    fn test_control_word_rounds_down() {
        // 48e6 / (115200 * 16) = 26.04
        assert_eq!(control_word(48_000_000, 115_200), 25);
        // 48e6 / (1_000_000 * 16) = 3.0
        assert_eq!(control_word(48_000_000, 1_000_000), 2);
    }

    #[test]
    fn test_control_word_below_precondition() {
        assert_eq!(control_word(100, 38_400), -1);
    }

    #[test]
    fn test_encode_control_word_little_endian() {
        assert_eq!(encode_control_word(77), [77, 0, 0, 0]);
        assert_eq!(encode_control_word(0x0102_0304), [0x04, 0x03, 0x02, 0x01]);
        assert_eq!(encode_control_word(-1), [0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_encode_block_index_low_byte_first() {
        assert_eq!(encode_block_index(300), [0x2C, 0x01]);
        assert_eq!(encode_block_index(0), [0x00, 0x00]);
        assert_eq!(encode_block_index(0xFFFF), [0xFF, 0xFF]);
    }

    #[test]
    fn test_checksum_is_sum_mod_256() {
        let data: Vec<u8> = (0..=255u8).chain(0..=10).collect();
        let expected = (data.iter().map(|&b| u32::from(b)).sum::<u32>() % 256) as u8;
        assert_eq!(checksum(&data), expected);
        assert_eq!(checksum(&data), checksum(&data));
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        assert_eq!(checksum(&[0x80, 0x80]), 0x00);
    }

    #[test]
    fn test_checksum_empty_is_zero() {
        assert_eq!(checksum(&[]), 0);
    }
}
