//! Flashing session.
//!
//! A [`Session`] owns the port for its whole lifetime and runs the three
//! stages of a flash in order:
//!
//! 1. negotiation (reset, handshake, baud switch, board descriptor)
//! 2. block transfer
//! 3. termination (end marker and final acknowledgement)
//!
//! Whatever the outcome, the port is switched back to the initial baud rate
//! and closed before [`Session::flash`] returns.
//!
//! ## Example
//!
//! ```rust,no_run
//! use hyperload::{FirmwareImage, SessionConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("firmware.hex")?;
//!     let config = SessionConfig::new(1_000_000);
//!
//!     #[cfg(feature = "native")]
//!     {
//!         use hyperload::{NativePort, Session};
//!
//!         let port = NativePort::open_for_session("/dev/ttyUSB0", &config)?;
//!         let mut session = Session::new(port, config);
//!         let report = session.flash(image.into_bytes(), |sent: usize, total: usize| {
//!             println!("Block {sent}/{total}");
//!         })?;
//!         println!("Flashed {} blocks to {}", report.blocks_sent, report.board.name);
//!     }
//!
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::port::{DEFAULT_TIMEOUT, INITIAL_BAUD, Port};
use crate::protocol::frame::{END_OF_TRANSMISSION, FINAL_ACK};
use crate::protocol::negotiation::{NegotiationState, Negotiator};
use crate::protocol::transfer::{BlockPlan, BlockTransfer, ProgressObserver, RetryPolicy};
use crate::protocol::{BoardParameters, Phase, wire};
use log::{debug, info, warn};
use std::time::Duration;

/// Default CPU clock of the target while the bootloader runs.
pub const DEFAULT_CLOCK_HZ: u32 = 48_000_000;

/// How long the reset lines are held asserted.
pub const DEFAULT_RESET_HOLD: Duration = Duration::from_millis(100);

/// Upper bound on the descriptor line length.
pub const DEFAULT_MAX_DESCRIPTOR_LEN: usize = 256;

/// Session configuration, fixed for the whole session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Baud rate to transfer blocks at.
    pub target_baud: u32,
    /// Baud rate the bootloader listens on after reset.
    pub initial_baud: u32,
    /// Target CPU clock in Hz, used for the control word.
    pub clock_hz: u32,
    /// Read timeout applied to the port when the session starts.
    pub read_timeout: Duration,
    /// How long the reset lines are held asserted.
    pub reset_hold: Duration,
    /// Longest descriptor line accepted.
    pub max_descriptor_len: usize,
    /// Block retry policy.
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_baud: INITIAL_BAUD,
            initial_baud: INITIAL_BAUD,
            clock_hz: DEFAULT_CLOCK_HZ,
            read_timeout: DEFAULT_TIMEOUT,
            reset_hold: DEFAULT_RESET_HOLD,
            max_descriptor_len: DEFAULT_MAX_DESCRIPTOR_LEN,
            retry: RetryPolicy::Unbounded,
        }
    }
}

impl SessionConfig {
    /// Create a configuration transferring at `target_baud`.
    pub fn new(target_baud: u32) -> Self {
        Self {
            target_baud,
            ..Default::default()
        }
    }

    /// Set the target CPU clock.
    #[must_use]
    pub fn with_clock_hz(mut self, clock_hz: u32) -> Self {
        self.clock_hz = clock_hz;
        self
    }

    /// Set the baud rate the bootloader starts at.
    #[must_use]
    pub fn with_initial_baud(mut self, initial_baud: u32) -> Self {
        self.initial_baud = initial_baud;
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set how long reset is held.
    #[must_use]
    pub fn with_reset_hold(mut self, hold: Duration) -> Self {
        self.reset_hold = hold;
        self
    }

    /// Set the longest accepted descriptor line.
    #[must_use]
    pub fn with_max_descriptor_len(mut self, len: usize) -> Self {
        self.max_descriptor_len = len;
        self
    }

    /// Set the block retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Check the configuration before any byte is sent.
    ///
    /// A control word for `target_baud * 16 > clock_hz` is `-1`; the device
    /// cannot run at that rate, but the value is still sent.
    pub fn validate(&self) -> Result<()> {
        if self.target_baud == 0 || self.initial_baud == 0 {
            return Err(Error::Config("baud rate must be non-zero".into()));
        }
        if self.clock_hz == 0 {
            return Err(Error::Config("clock frequency must be non-zero".into()));
        }
        if self.max_descriptor_len == 0 {
            return Err(Error::Config("descriptor length bound must be non-zero".into()));
        }
        if u64::from(self.target_baud) * 16 > u64::from(self.clock_hz) {
            warn!(
                "Baud rate {} is too fast for a {} Hz clock; the device will not keep up",
                self.target_baud, self.clock_hz
            );
        }
        Ok(())
    }
}

/// Where a session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Handshake in progress (or not yet started, `Negotiating(Idle)`).
    Negotiating(NegotiationState),
    /// Blocks are being streamed.
    Transferring,
    /// End marker sent, waiting for the final acknowledgement.
    Terminating,
    /// Session finished; all blocks were acknowledged.
    Complete,
    /// Session aborted in the given phase.
    Failed(Phase),
}

/// Phase plus transfer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    /// Current phase.
    pub phase: SessionPhase,
    /// Blocks acknowledged by the device.
    pub blocks_sent: usize,
    /// Blocks in the image.
    pub total_blocks: usize,
    /// Rejected block attempts.
    pub retries: usize,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Negotiating(NegotiationState::Idle),
            blocks_sent: 0,
            total_blocks: 0,
            retries: 0,
        }
    }
}

impl SessionState {
    /// Whether the session has not started yet.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.phase == SessionPhase::Negotiating(NegotiationState::Idle)
    }
}

/// Outcome of the end-of-transmission exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FinalAck {
    /// The device confirmed with `'*'`.
    Received,
    /// The device answered with another byte.
    Unexpected(u8),
    /// The device did not answer.
    Missing,
}

/// Summary of a completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashReport {
    /// Board parameters reported by the bootloader.
    pub board: BoardParameters,
    /// Blocks acknowledged.
    pub blocks_sent: usize,
    /// Blocks in the image.
    pub total_blocks: usize,
    /// Rejected block attempts.
    pub retries: usize,
    /// Final acknowledgement outcome.
    ///
    /// Anything but [`FinalAck::Received`] is a warning only: every block
    /// was already accepted.
    pub final_ack: FinalAck,
}

impl FlashReport {
    /// Whether the device confirmed the end of transmission.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.final_ack == FinalAck::Received
    }
}

/// A single flashing session over an owned port.
pub struct Session<P: Port> {
    port: P,
    config: SessionConfig,
    state: SessionState,
    board: Option<BoardParameters>,
}

impl<P: Port> Session<P> {
    /// Create a session. Nothing is sent until [`Session::flash`].
    pub fn new(port: P, config: SessionConfig) -> Self {
        Self {
            port,
            config,
            state: SessionState::default(),
            board: None,
        }
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current phase and counters.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Board parameters, once negotiation has read them.
    pub fn board(&self) -> Option<&BoardParameters> {
        self.board.as_ref()
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Consume the session and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Flash `image` and release the port.
    ///
    /// `progress` is told about every acknowledged block. A session runs
    /// once; later calls fail with [`Error::SessionConsumed`].
    pub fn flash<O>(&mut self, image: Vec<u8>, mut progress: O) -> Result<FlashReport>
    where
        O: ProgressObserver,
    {
        if !self.state.is_idle() {
            return Err(Error::SessionConsumed);
        }

        let result = self.run(image, &mut progress);
        if let Err(e) = &result {
            if !matches!(self.state.phase, SessionPhase::Failed(_)) {
                let phase = e
                    .phase()
                    .unwrap_or_else(|| self.current_phase());
                self.state.phase = SessionPhase::Failed(phase);
            }
        }

        self.release();
        result
    }

    fn run(&mut self, image: Vec<u8>, progress: &mut dyn ProgressObserver) -> Result<FlashReport> {
        self.config.validate()?;
        self.port.set_timeout(self.config.read_timeout)?;
        if self.config.retry == RetryPolicy::Unbounded {
            debug!("Block retries are unbounded; an unresponsive device stalls the session");
        }

        let board = Negotiator::new(&mut self.port, &self.config, &mut self.state).run()?;
        self.board = Some(board.clone());

        self.state.phase = SessionPhase::Transferring;
        let image_len = image.len();
        let plan = BlockPlan::new(image, board.block_size)?;
        info!("Total # of blocks to be flashed = {}", plan.total_blocks());
        if plan.padded_len() as u64 > board.application_capacity() {
            warn!(
                "Image ({image_len} bytes, {} padded) exceeds the {} bytes available on {}",
                plan.padded_len(),
                board.application_capacity(),
                board.name
            );
        }

        BlockTransfer::new(&mut self.port, self.config.retry, &mut self.state)
            .run(&plan, progress)?;

        let final_ack = self.terminate()?;
        self.state.phase = SessionPhase::Complete;

        Ok(FlashReport {
            board,
            blocks_sent: self.state.blocks_sent,
            total_blocks: self.state.total_blocks,
            retries: self.state.retries,
            final_ack,
        })
    }

    /// Send the end marker and read the final acknowledgement.
    fn terminate(&mut self) -> Result<FinalAck> {
        self.state.phase = SessionPhase::Terminating;
        wire::write_checked(&mut self.port, Phase::EndMarker, &END_OF_TRANSMISSION)?;

        let outcome = match wire::read_byte(&mut self.port, Phase::FinalAck) {
            Ok(FINAL_ACK) => FinalAck::Received,
            Ok(other) => FinalAck::Unexpected(other),
            Err(e) if e.is_timeout() => FinalAck::Missing,
            Err(e) => return Err(e),
        };

        match outcome {
            FinalAck::Received => info!("Flashing successful!"),
            FinalAck::Unexpected(byte) => {
                warn!("Final ack not received: expected {FINAL_ACK:#04x}, got {byte:#04x}");
            },
            FinalAck::Missing => warn!("Final ack not received before timeout"),
        }
        Ok(outcome)
    }

    /// Restore the initial baud rate and close the port.
    fn release(&mut self) {
        if let Err(e) = self.port.set_baud_rate(self.config.initial_baud) {
            warn!("Failed to restore baud rate {}: {e}", self.config.initial_baud);
        }
        if let Err(e) = self.port.close() {
            warn!("Failed to close {}: {e}", self.port.name());
        } else {
            debug!("Released {}", self.port.name());
        }
    }

    fn current_phase(&self) -> Phase {
        match self.state.phase {
            SessionPhase::Negotiating(state) => state.phase().unwrap_or(Phase::Sync),
            SessionPhase::Transferring => Phase::BlockAck,
            SessionPhase::Terminating | SessionPhase::Complete => Phase::FinalAck,
            SessionPhase::Failed(phase) => phase,
        }
    }
}
