//! Error types for hyperload.

use std::io;
use thiserror::Error;

use crate::protocol::Phase;

/// Result type for hyperload operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for hyperload operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The device did not answer before the transport timeout expired.
    #[error("Timeout during {phase}: {}", phase.failure_reason())]
    Timeout {
        /// Phase that was waiting for the device.
        phase: Phase,
    },

    /// The device answered with the wrong sentinel byte.
    #[error(
        "Protocol mismatch during {phase}: {} (expected {expected:#04x}, received {received:#04x})",
        phase.failure_reason()
    )]
    ProtocolMismatch {
        /// Phase that read the byte.
        phase: Phase,
        /// Byte the protocol requires at this point.
        expected: u8,
        /// Byte actually received.
        received: u8,
    },

    /// The transport accepted fewer bytes than requested.
    #[error("Incomplete write during {phase}: {written} of {expected} bytes accepted")]
    IncompleteWrite {
        /// Phase that issued the write.
        phase: Phase,
        /// Number of bytes requested.
        expected: usize,
        /// Number of bytes the transport accepted.
        written: usize,
    },

    /// The board descriptor line could not be parsed.
    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(String),

    /// The descriptor line ended before its terminator.
    #[error("Descriptor truncated after {received} bytes")]
    DescriptorTruncated {
        /// Bytes received before the stream stopped.
        received: usize,
    },

    /// The descriptor line exceeded the configured length bound.
    #[error("Descriptor exceeds {limit} bytes without a line terminator")]
    DescriptorTooLong {
        /// Configured maximum length.
        limit: usize,
    },

    /// Retry budget exhausted before every block was acknowledged.
    #[error("Transfer incomplete: {sent} of {total} blocks acknowledged")]
    TransferIncomplete {
        /// Blocks acknowledged by the device.
        sent: usize,
        /// Blocks in the image.
        total: usize,
    },

    /// The image needs more blocks than a 16-bit block index can address.
    #[error("Image too large: {blocks} blocks exceed the 16-bit block index")]
    ImageTooLarge {
        /// Blocks the image would need.
        blocks: usize,
    },

    /// Invalid or unreadable firmware image.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No serial port could be found.
    #[error("Device not found")]
    DeviceNotFound,

    /// The session already ran; a transport serves exactly one session.
    #[error("Session already used; open a new port to flash again")]
    SessionConsumed,

    /// The embedding application asked the operation to stop.
    #[error("Operation interrupted")]
    Interrupted,
}

impl Error {
    /// Protocol phase this error happened in, if it is a protocol error.
    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Timeout { phase }
            | Self::ProtocolMismatch { phase, .. }
            | Self::IncompleteWrite { phase, .. } => Some(*phase),
            Self::MalformedDescriptor(_)
            | Self::DescriptorTruncated { .. }
            | Self::DescriptorTooLong { .. } => Some(Phase::Descriptor),
            Self::ImageTooLarge { .. } => Some(Phase::BlockIndex),
            _ => None,
        }
    }

    /// Whether the serial device is absent.
    #[must_use]
    pub fn is_device_missing(&self) -> bool {
        match self {
            Self::DeviceNotFound => true,
            #[cfg(feature = "native")]
            Self::Serial(e) => e.kind() == serialport::ErrorKind::NoDevice,
            _ => false,
        }
    }

    /// Whether the error is a transport timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_message_names_phase_and_bytes() {
        let err = Error::ProtocolMismatch {
            phase: Phase::Sync,
            expected: 0xFF,
            received: 0x12,
        };
        let msg = err.to_string();
        assert!(msg.contains("sync"));
        assert!(msg.contains("no sync"));
        assert!(msg.contains("0xff"));
        assert!(msg.contains("0x12"));
    }

    #[test]
    fn test_phase_of_descriptor_errors() {
        assert_eq!(
            Error::MalformedDescriptor("x".into()).phase(),
            Some(Phase::Descriptor)
        );
        assert_eq!(
            Error::DescriptorTruncated { received: 3 }.phase(),
            Some(Phase::Descriptor)
        );
        assert_eq!(Error::DeviceNotFound.phase(), None);
    }

    #[test]
    fn test_image_too_large_is_a_block_index_error() {
        assert_eq!(
            Error::ImageTooLarge { blocks: 65_537 }.phase(),
            Some(Phase::BlockIndex)
        );
    }

    #[test]
    fn test_is_timeout() {
        assert!(Error::Timeout { phase: Phase::Ready }.is_timeout());
        assert!(Error::Io(io::Error::new(io::ErrorKind::TimedOut, "t")).is_timeout());
        assert!(!Error::Config("x".into()).is_timeout());
    }

    #[test]
    fn test_is_device_missing() {
        assert!(Error::DeviceNotFound.is_device_missing());
        assert!(!Error::Interrupted.is_device_missing());
        #[cfg(feature = "native")]
        assert!(
            Error::Serial(serialport::Error::new(serialport::ErrorKind::NoDevice, "gone"))
                .is_device_missing()
        );
    }
}
