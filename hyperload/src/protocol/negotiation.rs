//! Handshake and rate negotiation.
//!
//! Drives the bootloader from reset to the point where it accepts blocks:
//!
//! ```text
//! Idle -> WaitSync -> WaitDeviceId -> SendControlWord -> WaitControlAck
//!      -> BaudSwitch -> WaitDescStart -> ReadDescriptor -> WaitOk -> Ready
//! ```
//!
//! Any mismatch moves the machine to `Failed`, which is terminal.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::descriptor::BoardParameters;
use crate::protocol::frame::{
    ACK_STEP1, ACK_STEP2, DESC_START, LINE_END, OK, SYNC, control_word, encode_control_word,
};
use crate::protocol::{Phase, wire};
use crate::session::{SessionConfig, SessionPhase, SessionState};
use log::{debug, info, warn};

/// Negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Nothing sent yet; the device has not been reset.
    Idle,
    /// Waiting for the sync byte.
    WaitSync,
    /// Waiting for the device id byte.
    WaitDeviceId,
    /// About to send the control word.
    SendControlWord,
    /// Waiting for the control word echo.
    WaitControlAck,
    /// Switching the host to the requested baud rate.
    BaudSwitch,
    /// Waiting for the descriptor start character.
    WaitDescStart,
    /// Reading the descriptor line.
    ReadDescriptor,
    /// Waiting for the ready character.
    WaitOk,
    /// The device accepts blocks.
    Ready,
    /// Negotiation failed in the given phase.
    Failed(Phase),
}

impl NegotiationState {
    /// Protocol phase this state performs.
    #[must_use]
    pub fn phase(self) -> Option<Phase> {
        match self {
            Self::Idle | Self::WaitSync => Some(Phase::Sync),
            Self::WaitDeviceId => Some(Phase::DeviceId),
            Self::SendControlWord => Some(Phase::ControlWord),
            Self::WaitControlAck => Some(Phase::ControlAck),
            Self::BaudSwitch => Some(Phase::BaudSwitch),
            Self::WaitDescStart => Some(Phase::DescriptorStart),
            Self::ReadDescriptor => Some(Phase::Descriptor),
            Self::WaitOk => Some(Phase::Ready),
            Self::Ready => None,
            Self::Failed(phase) => Some(phase),
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed(_))
    }
}

/// Negotiation state machine over a borrowed port.
///
/// Every transition is mirrored into the shared [`SessionState`].
pub struct Negotiator<'a, P: Port + ?Sized> {
    port: &'a mut P,
    config: &'a SessionConfig,
    session: &'a mut SessionState,
    state: NegotiationState,
    control_word: [u8; 4],
    board: Option<BoardParameters>,
    interrupted: fn() -> bool,
}

impl<'a, P: Port + ?Sized> Negotiator<'a, P> {
    /// Create a negotiator in the `Idle` state.
    pub fn new(port: &'a mut P, config: &'a SessionConfig, session: &'a mut SessionState) -> Self {
        session.phase = SessionPhase::Negotiating(NegotiationState::Idle);
        Self {
            port,
            config,
            session,
            state: NegotiationState::Idle,
            control_word: [0; 4],
            board: None,
            interrupted: crate::is_interrupted_requested,
        }
    }

    /// Replace the interrupt check consulted before every transition.
    #[must_use]
    pub fn with_interrupt_check(mut self, check: fn() -> bool) -> Self {
        self.interrupted = check;
        self
    }

    /// Current state.
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Board parameters, once the descriptor has been read.
    pub fn board(&self) -> Option<&BoardParameters> {
        self.board.as_ref()
    }

    /// Run every transition until `Ready`.
    pub fn run(mut self) -> Result<BoardParameters> {
        while !self.state.is_terminal() {
            self.step()?;
        }
        self.board
            .ok_or_else(|| Error::MalformedDescriptor("no descriptor received".into()))
    }

    /// Perform one transition and return the new state.
    ///
    /// Terminal states are returned unchanged.
    pub fn step(&mut self) -> Result<NegotiationState> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }
        if (self.interrupted)() {
            let phase = self.state.phase().unwrap_or(Phase::Sync);
            warn!("Negotiation interrupted during {phase}");
            self.set_state(NegotiationState::Failed(phase));
            return Err(Error::Interrupted);
        }

        match self.transition() {
            Ok(next) => {
                debug!("Negotiation: {:?} -> {:?}", self.state, next);
                self.set_state(next);
                Ok(next)
            },
            Err(e) => {
                let phase = e
                    .phase()
                    .or_else(|| self.state.phase())
                    .unwrap_or(Phase::Sync);
                warn!("Negotiation failed during {phase}: {}", phase.failure_reason());
                self.set_state(NegotiationState::Failed(phase));
                Err(e)
            },
        }
    }

    fn set_state(&mut self, state: NegotiationState) {
        self.state = state;
        self.session.phase = match state {
            NegotiationState::Failed(phase) => SessionPhase::Failed(phase),
            other => SessionPhase::Negotiating(other),
        };
    }

    fn transition(&mut self) -> Result<NegotiationState> {
        use NegotiationState as S;

        match self.state {
            S::Idle => {
                debug!("Resetting device on {}", self.port.name());
                self.port.pulse_reset(self.config.reset_hold)?;
                Ok(S::WaitSync)
            },
            S::WaitSync => {
                wire::expect_byte(&mut *self.port, Phase::Sync, SYNC)?;
                wire::write_checked(&mut *self.port, Phase::Sync, &[ACK_STEP1])?;
                debug!("Initial handshake initiated");
                Ok(S::WaitDeviceId)
            },
            S::WaitDeviceId => {
                wire::expect_byte(&mut *self.port, Phase::DeviceId, ACK_STEP2)?;
                Ok(S::SendControlWord)
            },
            S::SendControlWord => {
                let value = control_word(self.config.clock_hz, self.config.target_baud);
                self.control_word = encode_control_word(value);
                debug!(
                    "Sending control word {value} for {} baud @ {} Hz",
                    self.config.target_baud, self.config.clock_hz
                );
                wire::write_checked(&mut *self.port, Phase::ControlWord, &self.control_word)?;
                Ok(S::WaitControlAck)
            },
            S::WaitControlAck => {
                wire::expect_byte(&mut *self.port, Phase::ControlAck, self.control_word[0])?;
                debug!("Control word acknowledged");
                Ok(S::BaudSwitch)
            },
            S::BaudSwitch => {
                // The device switches as soon as it has echoed the control
                // word; nothing confirms the switch on the wire.
                if self.config.target_baud != self.config.initial_baud {
                    debug!(
                        "Switching baud rate {} -> {}",
                        self.config.initial_baud, self.config.target_baud
                    );
                    self.port.set_baud_rate(self.config.target_baud)?;
                } else {
                    debug!("Requested baud rate equals initial rate, no switch");
                }
                Ok(S::WaitDescStart)
            },
            S::WaitDescStart => {
                wire::expect_byte(&mut *self.port, Phase::DescriptorStart, DESC_START)?;
                Ok(S::ReadDescriptor)
            },
            S::ReadDescriptor => {
                let line = wire::read_until(&mut *self.port, LINE_END, self.config.max_descriptor_len)?;
                debug!("Descriptor: ${}", String::from_utf8_lossy(&line));
                let board = BoardParameters::parse(&line)?;
                info!(
                    "Board {}: {} byte blocks, {} byte bootloader, {} KB flash",
                    board.name, board.block_size, board.bootloader_size_bytes, board.flash_size_kb
                );
                self.board = Some(board);
                Ok(S::WaitOk)
            },
            S::WaitOk => {
                wire::expect_byte(&mut *self.port, Phase::Ready, OK)?;
                debug!("Board ready");
                Ok(S::Ready)
            },
            S::Ready | S::Failed(_) => Ok(self.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::ScriptedPort;
    use std::time::Duration;

    fn config(target_baud: u32) -> SessionConfig {
        SessionConfig::new(target_baud).with_reset_hold(Duration::ZERO)
    }

    fn greeting(ack: u8) -> Vec<u8> {
        let mut bytes = vec![SYNC, ACK_STEP2, ack];
        bytes.extend_from_slice(b"$board1:256:512:128\n");
        bytes.push(OK);
        bytes
    }

    #[test]
    fn test_full_negotiation_at_initial_baud() {
        let mut port = ScriptedPort::booting(&greeting(77));
        let config = config(38400);
        let mut state = SessionState::default();

        let board = Negotiator::new(&mut port, &config, &mut state)
            .run()
            .unwrap();

        assert_eq!(board.name, "board1");
        assert_eq!(board.block_size, 256);
        assert_eq!(board.bootloader_size_bytes, 1024);
        assert_eq!(state.phase, SessionPhase::Negotiating(NegotiationState::Ready));
        assert_eq!(port.written(), vec![ACK_STEP1, 77, 0, 0, 0]);
        // Control word goes out as a single 4-byte write.
        assert_eq!(port.writes[1], vec![77, 0, 0, 0]);
        assert!(port.baud_history.is_empty());
    }

    #[test]
    fn test_negotiation_switches_baud_after_ack() {
        // 48 MHz / (115200 * 16) - 1 = 25
        let mut port = ScriptedPort::booting(&greeting(25));
        let config = config(115_200);
        let mut state = SessionState::default();

        Negotiator::new(&mut port, &config, &mut state)
            .run()
            .unwrap();

        assert_eq!(port.baud_history, vec![115_200]);
    }

    #[test]
    fn test_step_by_step_states() {
        let mut port = ScriptedPort::booting(&greeting(77));
        let config = config(38400);
        let mut state = SessionState::default();
        let mut negotiator = Negotiator::new(&mut port, &config, &mut state);

        use NegotiationState as S;
        let expected = [
            S::WaitSync,
            S::WaitDeviceId,
            S::SendControlWord,
            S::WaitControlAck,
            S::BaudSwitch,
            S::WaitDescStart,
            S::ReadDescriptor,
            S::WaitOk,
            S::Ready,
        ];
        for want in expected {
            assert_eq!(negotiator.step().unwrap(), want);
        }
        // Terminal state is sticky.
        assert_eq!(negotiator.step().unwrap(), S::Ready);
        assert!(negotiator.board().is_some());
    }

    #[test]
    fn test_interrupt_stops_before_next_step() {
        let mut port = ScriptedPort::booting(&greeting(77));
        let config = config(38400);
        let mut state = SessionState::default();

        let err = Negotiator::new(&mut port, &config, &mut state)
            .with_interrupt_check(|| true)
            .run()
            .unwrap_err();

        assert!(matches!(err, Error::Interrupted));
        assert_eq!(state.phase, SessionPhase::Failed(Phase::Sync));
        // The device was never reset.
        assert!(port.lines.is_empty());
        assert!(port.written().is_empty());
    }

    #[test]
    fn test_no_sync() {
        let mut port = ScriptedPort::booting(&[0x00]);
        let config = config(38400);
        let mut state = SessionState::default();

        let err = Negotiator::new(&mut port, &config, &mut state)
            .run()
            .unwrap_err();

        assert!(matches!(
            err,
            Error::ProtocolMismatch {
                phase: Phase::Sync,
                ..
            }
        ));
        assert_eq!(state.phase, SessionPhase::Failed(Phase::Sync));
        // Nothing is acknowledged without a sync byte.
        assert!(port.written().is_empty());
    }

    #[test]
    fn test_sync_timeout() {
        let mut port = ScriptedPort::booting(&[]);
        let config = config(38400);
        let mut state = SessionState::default();

        let err = Negotiator::new(&mut port, &config, &mut state)
            .run()
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { phase: Phase::Sync }));
        assert_eq!(state.phase, SessionPhase::Failed(Phase::Sync));
    }

    #[test]
    fn test_device_id_mismatch() {
        let mut port = ScriptedPort::booting(&[SYNC, 0x12]);
        let config = config(38400);
        let mut state = SessionState::default();

        let err = Negotiator::new(&mut port, &config, &mut state)
            .run()
            .unwrap_err();

        assert!(err.to_string().contains("device id mismatch"));
        assert_eq!(state.phase, SessionPhase::Failed(Phase::DeviceId));
    }

    #[test]
    fn test_control_word_short_write() {
        // ACK_STEP1 takes one byte of the budget, two of four control bytes fit.
        let mut port = ScriptedPort::booting(&[SYNC, ACK_STEP2]).with_write_limit(3);
        let config = config(38400);
        let mut state = SessionState::default();

        let err = Negotiator::new(&mut port, &config, &mut state)
            .run()
            .unwrap_err();

        assert!(matches!(
            err,
            Error::IncompleteWrite {
                phase: Phase::ControlWord,
                expected: 4,
                written: 2
            }
        ));
    }

    #[test]
    fn test_control_ack_mismatch() {
        let mut port = ScriptedPort::booting(&greeting(78));
        let config = config(38400);
        let mut state = SessionState::default();

        let err = Negotiator::new(&mut port, &config, &mut state)
            .run()
            .unwrap_err();

        assert!(matches!(
            err,
            Error::ProtocolMismatch {
                phase: Phase::ControlAck,
                expected: 77,
                received: 78
            }
        ));
        assert!(port.baud_history.is_empty());
    }

    #[test]
    fn test_missing_descriptor_start() {
        let mut port = ScriptedPort::booting(&[SYNC, ACK_STEP2, 77, b'#']);
        let config = config(38400);
        let mut state = SessionState::default();

        let err = Negotiator::new(&mut port, &config, &mut state)
            .run()
            .unwrap_err();

        assert!(err.to_string().contains("no descriptor"));
    }

    #[test]
    fn test_truncated_descriptor() {
        let mut bytes = vec![SYNC, ACK_STEP2, 77];
        bytes.extend_from_slice(b"$board1:256");
        let mut port = ScriptedPort::booting(&bytes);
        let config = config(38400);
        let mut state = SessionState::default();

        let err = Negotiator::new(&mut port, &config, &mut state)
            .run()
            .unwrap_err();

        assert!(matches!(err, Error::DescriptorTruncated { .. }));
        assert_eq!(state.phase, SessionPhase::Failed(Phase::Descriptor));
    }

    #[test]
    fn test_malformed_descriptor() {
        let mut bytes = vec![SYNC, ACK_STEP2, 77];
        bytes.extend_from_slice(b"$board1:256:512\n!");
        let mut port = ScriptedPort::booting(&bytes);
        let config = config(38400);
        let mut state = SessionState::default();

        let err = Negotiator::new(&mut port, &config, &mut state)
            .run()
            .unwrap_err();

        assert!(matches!(err, Error::MalformedDescriptor(_)));
    }

    #[test]
    fn test_board_not_ready() {
        let mut bytes = greeting(77);
        bytes.pop();
        bytes.push(b'?');
        let mut port = ScriptedPort::booting(&bytes);
        let config = config(38400);
        let mut state = SessionState::default();

        let err = Negotiator::new(&mut port, &config, &mut state)
            .run()
            .unwrap_err();

        assert!(err.to_string().contains("board not ready"));
        assert_eq!(state.phase, SessionPhase::Failed(Phase::Ready));
    }
}
