//! Byte-level read/write helpers shared by the protocol phases.
//!
//! Every helper maps transport outcomes onto phase-tagged errors so the
//! state machines above only deal with `Result`.

use crate::error::{Error, Result};
use crate::protocol::Phase;
use log::trace;
use std::io::{ErrorKind, Read, Write};

/// Read a single byte.
///
/// A timed-out read and a read returning nothing both surface as
/// [`Error::Timeout`] for `phase`.
pub(crate) fn read_byte<R: Read + ?Sized>(port: &mut R, phase: Phase) -> Result<u8> {
    let mut buf = [0u8; 1];
    loop {
        match port.read(&mut buf) {
            Ok(1) => {
                trace!("<= {:#04x} ({phase})", buf[0]);
                return Ok(buf[0]);
            },
            Ok(_) => return Err(Error::Timeout { phase }),
            Err(e) if e.kind() == ErrorKind::Interrupted => {},
            Err(e) if e.kind() == ErrorKind::TimedOut => return Err(Error::Timeout { phase }),
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// Read a byte and require it to equal `expected`.
pub(crate) fn expect_byte<R: Read + ?Sized>(port: &mut R, phase: Phase, expected: u8) -> Result<()> {
    let received = read_byte(port, phase)?;
    if received == expected {
        Ok(())
    } else {
        Err(Error::ProtocolMismatch {
            phase,
            expected,
            received,
        })
    }
}

/// Write `data` and report how many bytes the transport accepted.
///
/// Keeps writing until everything is accepted or the transport stops
/// accepting (zero-length write or timeout).
pub(crate) fn write_counted<W: Write + ?Sized>(port: &mut W, data: &[u8]) -> Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match port.write(&data[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {},
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WriteZero) => break,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    port.flush()?;
    Ok(written)
}

/// Write `data` and fail with [`Error::IncompleteWrite`] on a short write.
pub(crate) fn write_checked<W: Write + ?Sized>(port: &mut W, phase: Phase, data: &[u8]) -> Result<()> {
    let written = write_counted(port, data)?;
    trace!("=> {} bytes ({phase})", written);
    if written == data.len() {
        Ok(())
    } else {
        Err(Error::IncompleteWrite {
            phase,
            expected: data.len(),
            written,
        })
    }
}

/// Read bytes until `delimiter`, returning them without the delimiter.
///
/// Fails with [`Error::DescriptorTruncated`] when the stream stops before
/// the delimiter and [`Error::DescriptorTooLong`] once `max_len` bytes were
/// read without finding it.
pub(crate) fn read_until<R: Read + ?Sized>(
    port: &mut R,
    delimiter: u8,
    max_len: usize,
) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    loop {
        let byte = match read_byte(port, Phase::Descriptor) {
            Ok(b) => b,
            Err(Error::Timeout { .. }) => {
                return Err(Error::DescriptorTruncated {
                    received: line.len(),
                });
            },
            Err(e) => return Err(e),
        };
        if byte == delimiter {
            return Ok(line);
        }
        if line.len() >= max_len {
            return Err(Error::DescriptorTooLong { limit: max_len });
        }
        line.push(byte);
    }
}
