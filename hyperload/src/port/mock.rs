//! Scripted in-memory port for protocol tests.
//!
//! Reads are served from a queue of device bytes and time out once it is
//! empty; writes are recorded one entry per `write` call so tests can
//! assert exactly what the host sent and in which chunks.

use crate::error::Result;
use crate::port::{INITIAL_BAUD, Port};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

/// Line-control transition recorded by [`ScriptedPort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Line {
    Dtr(bool),
    Rts(bool),
}

pub(crate) struct ScriptedPort {
    pub read_queue: VecDeque<u8>,
    /// Device bytes that become readable only after the next reset.
    pub after_reset: VecDeque<u8>,
    pub writes: Vec<Vec<u8>>,
    pub lines: Vec<Line>,
    pub baud_history: Vec<u32>,
    pub baud: u32,
    pub clears: usize,
    pub closed: bool,
    write_limit: Option<usize>,
    timeout: Duration,
}

impl ScriptedPort {
    pub fn new(response: &[u8]) -> Self {
        Self {
            read_queue: response.iter().copied().collect(),
            after_reset: VecDeque::new(),
            writes: Vec::new(),
            lines: Vec::new(),
            baud_history: Vec::new(),
            baud: INITIAL_BAUD,
            clears: 0,
            closed: false,
            write_limit: None,
            timeout: Duration::from_millis(10),
        }
    }

    /// Script a device that only starts talking once it is reset.
    pub fn booting(response: &[u8]) -> Self {
        let mut port = Self::new(&[]);
        port.after_reset = response.iter().copied().collect();
        port
    }

    /// Accept at most `limit` bytes per write call.
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    /// All written bytes, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.writes.concat()
    }
}

impl Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        if self.read_queue.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.read_queue.len());
        for (slot, byte) in buf.iter_mut().zip(self.read_queue.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        let n = match self.write_limit {
            Some(limit) => {
                // Accept `limit` bytes in total, then stall.
                let n = buf.len().min(limit);
                self.write_limit = Some(limit - n);
                n
            },
            None => buf.len(),
        };
        if n > 0 {
            self.writes.push(buf[..n].to_vec());
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for ScriptedPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud = baud_rate;
        self.baud_history.push(baud_rate);
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.clears += 1;
        self.read_queue.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.lines.push(Line::Dtr(level));
        if !level {
            // Releasing DTR lets the device boot; its greeting becomes readable.
            let pending: Vec<u8> = self.after_reset.drain(..).collect();
            self.read_queue.extend(pending);
        }
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.lines.push(Line::Rts(level));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
