//! Block transfer engine.
//!
//! Each block goes out as:
//!
//! ```text
//! +----------+----------+--------------------+----------+
//! | idx low  | idx high |  data (block size) | checksum |
//! +----------+----------+--------------------+----------+
//! |    1     |    1     |     block_size     |    1     |
//! +----------+----------+--------------------+----------+
//! ```
//!
//! and is answered by a single byte: `'!'` accepts the block, anything else
//! asks for the same block again.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::frame::{OK, checksum, encode_block_index};
use crate::protocol::{Phase, wire};
use crate::session::{SessionPhase, SessionState};
use log::{debug, trace, warn};
use std::num::NonZeroU32;

/// Highest number of blocks a 16-bit block index can address.
pub const MAX_BLOCKS: usize = u16::MAX as usize + 1;

/// How often a block is sent before the transfer gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Resend until the device accepts the block.
    ///
    /// This matches the bootloader tooling, but a device that never
    /// acknowledges keeps the session looping forever.
    #[default]
    Unbounded,
    /// Give up after this many attempts of the same block.
    MaxAttempts(NonZeroU32),
}

impl RetryPolicy {
    /// Policy allowing `attempts` sends per block; `0` means unbounded.
    #[must_use]
    pub fn from_max_attempts(attempts: u32) -> Self {
        NonZeroU32::new(attempts).map_or(Self::Unbounded, Self::MaxAttempts)
    }

    /// Whether another attempt is allowed after `attempts` failed ones.
    #[must_use]
    pub fn allows_another(self, attempts: u32) -> bool {
        match self {
            Self::Unbounded => true,
            Self::MaxAttempts(max) => attempts < max.get(),
        }
    }
}

/// Receives a notification for each acknowledged block.
pub trait ProgressObserver {
    /// Block `index` (1-based count of acknowledged blocks) out of `total`.
    fn on_block_sent(&mut self, index: usize, total: usize);
}

impl<F: FnMut(usize, usize)> ProgressObserver for F {
    fn on_block_sent(&mut self, index: usize, total: usize) {
        self(index, total);
    }
}

/// One block as transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block<'a> {
    /// Block index.
    pub index: u16,
    /// Exactly `block_size` bytes of image data.
    pub content: &'a [u8],
    /// Checksum of `content`.
    pub checksum: u8,
}

/// Image split into fixed-size blocks.
///
/// The block count is taken from the unpadded length; the buffer is then
/// zero-padded to a whole number of blocks.
#[derive(Debug, Clone)]
pub struct BlockPlan {
    data: Vec<u8>,
    block_size: usize,
    total_blocks: usize,
}

impl BlockPlan {
    /// Split `image` into blocks of `block_size` bytes.
    pub fn new(mut image: Vec<u8>, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::Config("block size must be non-zero".into()));
        }

        let total_blocks = image.len().div_ceil(block_size);
        if total_blocks > MAX_BLOCKS {
            return Err(Error::ImageTooLarge {
                blocks: total_blocks,
            });
        }

        let padded_len = total_blocks * block_size;
        debug!(
            "Image {} bytes -> {total_blocks} blocks of {block_size} ({} padding bytes)",
            image.len(),
            padded_len - image.len()
        );
        image.resize(padded_len, 0x00);

        Ok(Self {
            data: image,
            block_size,
            total_blocks,
        })
    }

    /// Number of blocks to transfer.
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Padded image length.
    pub fn padded_len(&self) -> usize {
        self.data.len()
    }

    /// Padded image data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Block `index`, or `None` past the end.
    #[allow(clippy::cast_possible_truncation)]
    pub fn block(&self, index: usize) -> Option<Block<'_>> {
        if index >= self.total_blocks {
            return None;
        }
        let start = index * self.block_size;
        let content = &self.data[start..start + self.block_size];
        Some(Block {
            // total_blocks <= MAX_BLOCKS keeps the index within u16.
            index: index as u16,
            content,
            checksum: checksum(content),
        })
    }

    /// Iterate over all blocks in order.
    pub fn blocks(&self) -> impl Iterator<Item = Block<'_>> + '_ {
        (0..self.total_blocks).filter_map(|i| self.block(i))
    }
}

/// Streams a [`BlockPlan`] to a device that has completed negotiation.
pub struct BlockTransfer<'a, P: Port + ?Sized> {
    port: &'a mut P,
    retry: RetryPolicy,
    session: &'a mut SessionState,
    interrupted: fn() -> bool,
}

impl<'a, P: Port + ?Sized> BlockTransfer<'a, P> {
    /// Create a transfer over `port`.
    pub fn new(port: &'a mut P, retry: RetryPolicy, session: &'a mut SessionState) -> Self {
        Self {
            port,
            retry,
            session,
            interrupted: crate::is_interrupted_requested,
        }
    }

    /// Replace the interrupt check consulted before every block attempt.
    #[must_use]
    pub fn with_interrupt_check(mut self, check: fn() -> bool) -> Self {
        self.interrupted = check;
        self
    }

    /// Send every block, resending a block until it is acknowledged.
    pub fn run<O>(&mut self, plan: &BlockPlan, progress: &mut O) -> Result<()>
    where
        O: ProgressObserver + ?Sized,
    {
        let total = plan.total_blocks();
        self.session.phase = SessionPhase::Transferring;
        self.session.total_blocks = total;
        self.session.blocks_sent = 0;

        for block in plan.blocks() {
            let mut attempts: u32 = 0;
            loop {
                if (self.interrupted)() {
                    warn!(
                        "Interrupted after {} of {total} blocks",
                        self.session.blocks_sent
                    );
                    return Err(Error::Interrupted);
                }
                attempts += 1;
                self.send_block(&block)?;

                if self.read_ack(block.index)? {
                    break;
                }

                self.session.retries += 1;
                if !self.retry.allows_another(attempts) {
                    warn!("Block {} rejected {attempts} times, giving up", block.index);
                    return Err(Error::TransferIncomplete {
                        sent: self.session.blocks_sent,
                        total,
                    });
                }
                warn!(
                    "Failed to receive ack for block {}, retrying (attempt {})",
                    block.index,
                    attempts + 1
                );
            }

            self.session.blocks_sent += 1;
            progress.on_block_sent(self.session.blocks_sent, total);
        }

        debug!("All {total} blocks acknowledged");
        Ok(())
    }

    /// Write index, content and checksum of one block.
    fn send_block(&mut self, block: &Block<'_>) -> Result<()> {
        let [low, high] = encode_block_index(block.index);
        wire::write_checked(&mut *self.port, Phase::BlockIndex, &[low])?;
        wire::write_checked(&mut *self.port, Phase::BlockIndex, &[high])?;
        wire::write_checked(&mut *self.port, Phase::BlockData, block.content)?;
        wire::write_checked(&mut *self.port, Phase::BlockChecksum, &[block.checksum])?;
        trace!(
            "Block {} sent ({} bytes, checksum {:#04x})",
            block.index,
            block.content.len(),
            block.checksum
        );
        Ok(())
    }

    /// Read the block acknowledgement.
    ///
    /// A silent device counts as a rejection so the block is resent.
    fn read_ack(&mut self, index: u16) -> Result<bool> {
        match wire::read_byte(&mut *self.port, Phase::BlockAck) {
            Ok(OK) => Ok(true),
            Ok(other) => {
                debug!("Block {index} answered with {other:#04x}");
                Ok(false)
            },
            Err(Error::Timeout { .. }) => {
                debug!("Block {index} not answered before timeout");
                Ok(false)
            },
            Err(e) => Err(e),
        }
    }
}
