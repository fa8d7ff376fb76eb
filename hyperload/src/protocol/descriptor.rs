//! Board descriptor parsing.
//!
//! After the control word is acknowledged the bootloader describes the
//! board with one ASCII line:
//!
//! ```text
//! $<name>:<block size>:<bootloader size in 16-bit words>:<flash size in KB>\n
//! ```

use crate::error::{Error, Result};
use crate::protocol::frame::{DESC_START, FIELD_SEPARATOR, LINE_END};
use log::debug;
use std::fmt;

/// Number of fields in a descriptor line.
const FIELD_COUNT: usize = 4;

/// Flash geometry reported by the bootloader.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoardParameters {
    /// Board name.
    pub name: String,
    /// Transfer block size in bytes. Always non-zero.
    pub block_size: usize,
    /// Bootloader size in bytes (the device reports 16-bit words).
    pub bootloader_size_bytes: u32,
    /// Flash size in kilobytes.
    pub flash_size_kb: u32,
}

impl BoardParameters {
    /// Parse a descriptor line.
    ///
    /// The leading `$` and the trailing line terminator (`\n` or `\r\n`) are
    /// optional, so both the raw line and the terminator-stripped body parse.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let body = raw.strip_prefix(&[DESC_START]).unwrap_or(raw);
        let body = body.strip_suffix(&[LINE_END]).unwrap_or(body);
        let body = body.strip_suffix(b"\r").unwrap_or(body);

        let fields: Vec<&[u8]> = body.split(|&b| b == FIELD_SEPARATOR).collect();
        if fields.len() < FIELD_COUNT {
            return Err(Error::MalformedDescriptor(format!(
                "expected {FIELD_COUNT} fields, found {} in {:?}",
                fields.len(),
                String::from_utf8_lossy(raw)
            )));
        }
        if fields.len() > FIELD_COUNT {
            let extra: Vec<_> = fields[FIELD_COUNT..]
                .iter()
                .map(|f| String::from_utf8_lossy(f))
                .collect();
            debug!("Ignoring extra descriptor fields: {}", extra.join(":"));
        }

        let name = String::from_utf8_lossy(fields[0]).trim().to_string();
        let block_size = parse_number(fields[1], "block size")?;
        let bootloader_words = parse_number(fields[2], "bootloader size")?;
        let flash_size_kb = parse_number(fields[3], "flash size")?;

        if block_size == 0 {
            return Err(Error::MalformedDescriptor("block size is zero".into()));
        }

        let bootloader_size_bytes = bootloader_words.checked_mul(2).ok_or_else(|| {
            Error::MalformedDescriptor(format!("bootloader size {bootloader_words} overflows"))
        })?;

        Ok(Self {
            name,
            block_size: block_size as usize,
            bootloader_size_bytes,
            flash_size_kb,
        })
    }

    /// Bytes of flash left for the application after the bootloader.
    #[must_use]
    pub fn application_capacity(&self) -> u64 {
        (u64::from(self.flash_size_kb) * 1024).saturating_sub(u64::from(self.bootloader_size_bytes))
    }
}

fn parse_number(field: &[u8], what: &str) -> Result<u32> {
    let text = std::str::from_utf8(field)
        .map_err(|_| Error::MalformedDescriptor(format!("{what} is not ASCII")))?
        .trim();
    text.parse()
        .map_err(|e| Error::MalformedDescriptor(format!("invalid {what} {text:?}: {e}")))
}

impl fmt::Display for BoardParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Board              = {}", self.name)?;
        writeln!(f, "Block (Chunk) Size = {} bytes", self.block_size)?;
        writeln!(f, "Bootloader Size    = {} bytes", self.bootloader_size_bytes)?;
        write!(f, "Flash Size         = {} KBytes", self.flash_size_kb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_line() {
        let params = BoardParameters::parse(b"$board1:256:512:128\n").unwrap();
        assert_eq!(
            params,
            BoardParameters {
                name: "board1".into(),
                block_size: 256,
                bootloader_size_bytes: 1024,
                flash_size_kb: 128,
            }
        );
    }

    #[test]
    fn test_parse_without_markers() {
        let params = BoardParameters::parse(b"SJ2:4096:8192:512").unwrap();
        assert_eq!(params.name, "SJ2");
        assert_eq!(params.block_size, 4096);
        assert_eq!(params.bootloader_size_bytes, 16384);
        assert_eq!(params.flash_size_kb, 512);
    }

    #[test]
    fn test_parse_crlf() {
        let params = BoardParameters::parse(b"$lpc:512:4096:512\r\n").unwrap();
        assert_eq!(params.flash_size_kb, 512);
    }

    #[test]
    fn test_parse_too_few_fields() {
        let err = BoardParameters::parse(b"$board1:256:512\n").unwrap_err();
        assert!(matches!(err, Error::MalformedDescriptor(_)));
    }

    #[test]
    fn test_parse_ignores_extra_fields() {
        let params = BoardParameters::parse(b"$SJ2:256:512:128:rev2\n").unwrap();
        assert_eq!(params.name, "SJ2");
        assert_eq!(params.block_size, 256);
        assert_eq!(params.bootloader_size_bytes, 1024);
        assert_eq!(params.flash_size_kb, 128);
    }

    #[test]
    fn test_parse_non_numeric() {
        let err = BoardParameters::parse(b"$board1:abc:512:128\n").unwrap_err();
        assert!(err.to_string().contains("block size"));
    }

    #[test]
    fn test_parse_zero_block_size() {
        let err = BoardParameters::parse(b"$board1:0:512:128\n").unwrap_err();
        assert!(err.to_string().contains("zero"));
    }

    #[test]
    fn test_application_capacity() {
        let params = BoardParameters::parse(b"$b:256:512:128").unwrap();
        assert_eq!(params.application_capacity(), 128 * 1024 - 1024);
    }

    #[test]
    fn test_display() {
        let params = BoardParameters::parse(b"$board1:256:512:128").unwrap();
        let text = params.to_string();
        assert!(text.contains("board1"));
        assert!(text.contains("1024 bytes"));
        assert!(text.contains("128 KBytes"));
    }
}
