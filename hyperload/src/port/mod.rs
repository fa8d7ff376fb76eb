//! Port abstraction for serial communication.
//!
//! The protocol layer never touches a concrete serial driver. It talks to a
//! [`Port`], which supplies blocking reads and writes bounded by a timeout,
//! baud rate control and the DTR/RTS lines used to reset the target.
//!
//! ```text
//! +------------------------------+
//! |        Protocol Layer        |
//! | (negotiation, block transfer)|
//! +--------------+---------------+
//!                |
//!                v
//! +--------------+---------------+
//! |          Port Trait          |
//! +--------------+---------------+
//!                |
//!                v
//! +--------------+---------------+
//! |   NativePort (serialport)    |
//! +------------------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use hyperload::port::{Port, SerialConfig};
//!
//! fn example<P: Port>(port: &mut P) -> hyperload::Result<()> {
//!     port.pulse_reset(std::time::Duration::from_millis(100))?;
//!     port.set_baud_rate(115200)?;
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use log::trace;

use crate::error::Result;

/// Baud rate the Hyperload bootloader listens on after reset.
pub const INITIAL_BAUD: u32 = 38400;

/// Read timeout used for a flashing session.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and how fast to open a serial port.
///
/// Framing is fixed at 8N1 without flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: INITIAL_BAUD,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Byte-stream transport used by a flashing session.
///
/// Reads block for at most [`Port::timeout`]; a read that times out or
/// returns nothing is a protocol failure at the phase that issued it.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Set the baud rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Reset the target into its bootloader.
    ///
    /// Asserts RTS and DTR, holds them for `hold` so the reset circuitry
    /// settles, discards anything buffered in either direction, then
    /// releases both lines to let the device boot.
    fn pulse_reset(&mut self, hold: Duration) -> Result<()> {
        trace!("Asserting reset on {}", self.name());
        self.set_rts(true)?;
        self.set_dtr(true)?;
        thread::sleep(hold);
        self.clear_buffers()?;
        std::io::Write::flush(self)?;
        self.set_rts(false)?;
        self.set_dtr(false)?;
        trace!("Reset released on {}", self.name());
        Ok(())
    }
}

#[cfg(feature = "native")]
pub use native::{NativePort, available_ports};
