//! # hyperload
//!
//! A host-side client for the Hyperload serial bootloader.
//!
//! The bootloader runs on SJOne/SJ2-class boards. After a DTR/RTS reset it
//! handshakes with the host, switches to the requested baud rate, reports
//! its flash geometry and then accepts the application image as a sequence
//! of checksummed, individually acknowledged blocks.
//!
//! This crate provides:
//!
//! - Intel HEX and raw binary image loading
//! - The Hyperload frame codec and descriptor parser
//! - The negotiation state machine and block transfer engine
//! - A [`Session`] that sequences a whole flash and always releases the port
//!
//! ## Features
//!
//! - `native` (default): serial port support via the `serialport` crate
//! - `serde`: serialization support for reports and port listings
//!
//! ## Example
//!
//! ```rust,no_run
//! use hyperload::{FirmwareImage, RetryPolicy, SessionConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("firmware.hex")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         use hyperload::{NativePort, SerialConfig, Session};
//!
//!         let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 38400))?;
//!         let config = SessionConfig::new(1_000_000)
//!             .with_clock_hz(48_000_000)
//!             .with_retry(RetryPolicy::from_max_attempts(5));
//!
//!         let report = Session::new(port, config).flash(
//!             image.into_bytes(),
//!             |sent: usize, total: usize| println!("{sent}/{total}"),
//!         )?;
//!         println!("{}", report.board);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker consulted between block attempts.
///
/// The checker should return `true` when the current flash should stop
/// (for example after Ctrl-C in a CLI). Only the first registration wins.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(feature = "native")]
pub use device::auto_detect_port;
#[cfg(feature = "native")]
pub use port::{NativePort, available_ports};
pub use {
    device::{DetectedPort, DeviceKind, format_port_list, select_port},
    error::{Error, Result},
    image::{FirmwareImage, ImageFormat},
    port::{INITIAL_BAUD, Port, PortInfo, SerialConfig},
    protocol::{BlockPlan, BoardParameters, Phase, ProgressObserver, RetryPolicy},
    session::{FinalAck, FlashReport, Session, SessionConfig, SessionPhase, SessionState},
};
