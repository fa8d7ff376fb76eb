//! Firmware image loading.
//!
//! The bootloader takes a flat byte image written from the start of the
//! application area. Intel HEX files are flattened from their lowest
//! address, with gaps filled as erased flash (`0xFF`); anything else is
//! sent as-is.

use crate::error::{Error, Result};
use log::debug;
use std::fmt;
use std::path::Path;

/// Largest address span a HEX file may cover once flattened.
pub const MAX_IMAGE_SPAN: u64 = 64 * 1024 * 1024;

/// Value of erased flash, used to fill gaps between HEX records.
pub const ERASED_BYTE: u8 = 0xFF;

/// On-disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ImageFormat {
    /// Intel HEX records.
    IntelHex,
    /// Raw binary.
    Binary,
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IntelHex => write!(f, "Intel HEX"),
            Self::Binary => write!(f, "binary"),
        }
    }
}

impl ImageFormat {
    /// Guess the format from the file extension, then from the content.
    pub fn guess(path: &Path, raw: &[u8]) -> Self {
        let ext = path
            .extension()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if ["hex", "ihex", "ihx"].contains(&ext.as_str()) {
            return Self::IntelHex;
        }

        if raw.first() == Some(&b':')
            && raw
                .iter()
                .all(|&c| c.is_ascii_hexdigit() || matches!(c, b':' | b'\n' | b'\r'))
        {
            Self::IntelHex
        } else {
            Self::Binary
        }
    }
}

/// A flat firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    format: ImageFormat,
    base_address: u32,
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Load an image from a file, guessing its format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)?;
        let format = ImageFormat::guess(path, &raw);
        debug!("Read {} ({} bytes) as {format}", path.display(), raw.len());

        let image = match format {
            ImageFormat::IntelHex => {
                let text = std::str::from_utf8(&raw)
                    .map_err(|e| Error::InvalidImage(format!("HEX file is not text: {e}")))?;
                Self::from_ihex(text)?
            },
            ImageFormat::Binary => Self::from_binary(raw),
        };
        debug!(
            "Loaded {} ({format}, {} bytes at {:#010x})",
            path.display(),
            image.len(),
            image.base_address
        );
        Ok(image)
    }

    /// Wrap raw bytes as an image based at address zero.
    pub fn from_binary(data: Vec<u8>) -> Self {
        Self {
            format: ImageFormat::Binary,
            base_address: 0,
            data,
        }
    }

    /// Decode Intel HEX text.
    pub fn from_ihex(text: &str) -> Result<Self> {
        use ihex::Record;

        let mut segment_base: u32 = 0;
        let mut sections: Vec<(u32, Vec<u8>)> = Vec::new();

        for record in ihex::Reader::new(text) {
            let record = record.map_err(|e| Error::InvalidImage(e.to_string()))?;
            match record {
                Record::Data { offset, value } => {
                    sections.push((segment_base.wrapping_add(u32::from(offset)), value));
                },
                Record::ExtendedSegmentAddress(address) => {
                    segment_base = u32::from(address) * 16;
                },
                Record::ExtendedLinearAddress(address) => {
                    segment_base = u32::from(address) << 16;
                },
                Record::EndOfFile
                | Record::StartSegmentAddress { .. }
                | Record::StartLinearAddress(_) => {},
            }
        }

        let (base_address, data) = flatten(sections)?;
        Ok(Self {
            format: ImageFormat::IntelHex,
            base_address,
            data,
        })
    }

    /// Format the image was loaded from.
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Address of the first byte; zero for binary images.
    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    /// Image length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image holds no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take the image bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Lay sections out contiguously from the lowest address.
fn flatten(mut sections: Vec<(u32, Vec<u8>)>) -> Result<(u32, Vec<u8>)> {
    sections.retain(|(_, data)| !data.is_empty());
    sections.sort_by_key(|(address, _)| *address);

    let Some(start) = sections.first().map(|(address, _)| *address) else {
        return Err(Error::InvalidImage("HEX file contains no data records".into()));
    };
    let end = sections
        .iter()
        .map(|(address, data)| u64::from(*address) + data.len() as u64)
        .max()
        .unwrap_or(u64::from(start));

    let span = end - u64::from(start);
    if span > MAX_IMAGE_SPAN {
        return Err(Error::InvalidImage(format!(
            "records span {span} bytes from {start:#010x}, more than {MAX_IMAGE_SPAN}"
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let mut binary = vec![ERASED_BYTE; span as usize];
    for (address, data) in sections {
        let offset = (address - start) as usize;
        binary[offset..offset + data.len()].copy_from_slice(&data);
    }
    debug!("Flattened HEX image: {span} bytes from {start:#010x}");
    Ok((start, binary))
}
