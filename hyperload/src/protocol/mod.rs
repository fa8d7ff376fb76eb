//! Hyperload protocol implementation.
//!
//! The protocol is a byte-oriented exchange over a UART link:
//!
//! ```text
//! Host                                   Device
//!  |                                       | <- reset (DTR/RTS)
//!  |<------------------ 0xFF --------------|  sync
//!  |------------------- 0x55 ------------->|  ack step 1
//!  |<------------------ 0xAA --------------|  device id
//!  |------------- control word (i32 LE) -->|
//!  |<----------- low byte of control word -|  (baud switch happens here)
//!  |<------- "$name:block:words:kb\n" -----|  descriptor
//!  |<------------------ '!' ---------------|  ready
//!  |-- idx lo, idx hi, data[block], sum -->|  repeated per block
//!  |<----------- '!' (ok) / other (retry) -|
//!  |------------------- 0xFF 0xFF -------->|  end of transmission
//!  |<------------------ '*' ---------------|  final ack
//! ```

pub mod descriptor;
pub mod frame;
pub mod negotiation;
pub mod transfer;
pub(crate) mod wire;

use std::fmt;

pub use descriptor::BoardParameters;
pub use frame::{checksum, control_word, encode_block_index, encode_control_word};
pub use negotiation::{NegotiationState, Negotiator};
pub use transfer::{Block, BlockPlan, BlockTransfer, ProgressObserver, RetryPolicy};

/// Step of the exchange a byte was read or written in.
///
/// Carried by protocol errors so a failure can be traced back to the exact
/// point of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Waiting for the sync byte after reset.
    Sync,
    /// Waiting for the device id byte.
    DeviceId,
    /// Sending the control word.
    ControlWord,
    /// Waiting for the control word acknowledgement.
    ControlAck,
    /// Switching the host baud rate.
    BaudSwitch,
    /// Waiting for the descriptor start character.
    DescriptorStart,
    /// Reading the descriptor line.
    Descriptor,
    /// Waiting for the ready character.
    Ready,
    /// Sending a block index.
    BlockIndex,
    /// Sending block content.
    BlockData,
    /// Sending a block checksum.
    BlockChecksum,
    /// Waiting for a block acknowledgement.
    BlockAck,
    /// Sending the end-of-transmission marker.
    EndMarker,
    /// Waiting for the final acknowledgement.
    FinalAck,
}

impl Phase {
    /// Short reason reported when this phase fails.
    #[must_use]
    pub fn failure_reason(self) -> &'static str {
        match self {
            Self::Sync => "no sync",
            Self::DeviceId => "device id mismatch",
            Self::ControlWord => "control word write incomplete",
            Self::ControlAck => "control word not acknowledged",
            Self::BaudSwitch => "baud switch failed",
            Self::DescriptorStart => "no descriptor",
            Self::Descriptor => "malformed descriptor",
            Self::Ready => "board not ready",
            Self::BlockIndex | Self::BlockData | Self::BlockChecksum => "block write incomplete",
            Self::BlockAck => "block not acknowledged",
            Self::EndMarker => "end marker write incomplete",
            Self::FinalAck => "final acknowledgement missing",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sync => "sync",
            Self::DeviceId => "device id",
            Self::ControlWord => "control word",
            Self::ControlAck => "control ack",
            Self::BaudSwitch => "baud switch",
            Self::DescriptorStart => "descriptor start",
            Self::Descriptor => "descriptor",
            Self::Ready => "ready",
            Self::BlockIndex => "block index",
            Self::BlockData => "block data",
            Self::BlockChecksum => "block checksum",
            Self::BlockAck => "block ack",
            Self::EndMarker => "end marker",
            Self::FinalAck => "final ack",
        };
        f.write_str(name)
    }
}
