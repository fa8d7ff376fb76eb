//! Serial transport backed by the `serialport` crate.
//!
//! The bootloader always talks 8N1 without flow control; only the baud rate
//! and the read timeout vary between sessions.

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortInfo, SerialConfig},
        session::SessionConfig,
    },
    log::{debug, trace},
    serialport::{ClearBuffer, SerialPort, SerialPortType},
    std::{
        io::{self, Read, Write},
        time::Duration,
    },
};

/// Serial port opened on the host.
///
/// Dropping or [closing](Port::close) the port releases the device; any I/O
/// after that fails with [`io::ErrorKind::NotConnected`].
pub struct NativePort {
    inner: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

impl NativePort {
    /// Open `config.port_name` at `config.baud_rate`, 8N1, no flow control.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!(
            "Opening {} @ {} baud (timeout {:?})",
            config.port_name, config.baud_rate, config.timeout
        );
        let inner = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        Ok(Self {
            inner: Some(inner),
            name: config.port_name.clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
        })
    }

    /// Open a port the way a flashing session expects to find it: at the
    /// bootloader's initial baud rate with the session read timeout.
    pub fn open_for_session(port_name: &str, session: &SessionConfig) -> Result<Self> {
        let config = SerialConfig::new(port_name, session.initial_baud)
            .with_timeout(session.read_timeout);
        Self::open(&config)
    }

    fn inner(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port closed"))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.inner()?.set_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.inner()?.set_baud_rate(baud_rate)?;
        trace!("{} now at {baud_rate} baud", self.name);
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.inner()?.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("DTR {}", if level { "asserted" } else { "released" });
        self.inner()?.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("RTS {}", if level { "asserted" } else { "released" });
        self.inner()?.write_request_to_send(level)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.inner.take().is_some() {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner()?.flush()
    }
}

impl From<serialport::SerialPortInfo> for PortInfo {
    fn from(info: serialport::SerialPortInfo) -> Self {
        let mut port = Self {
            name: info.port_name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        };
        if let SerialPortType::UsbPort(usb) = info.port_type {
            port.vid = Some(usb.vid);
            port.pid = Some(usb.pid);
            port.manufacturer = usb.manufacturer;
            port.product = usb.product;
            port.serial_number = usb.serial_number;
        }
        port
    }
}

/// Serial ports currently present on the host.
pub fn available_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports().map_err(Error::Serial)?;
    Ok(ports.into_iter().map(PortInfo::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::{SerialPortInfo, UsbPortInfo};

    #[test]
    fn test_available_ports_does_not_panic() {
        let _ = available_ports();
    }

    #[test]
    fn test_open_missing_port_fails() {
        let session = SessionConfig::new(115_200);
        assert!(NativePort::open_for_session("/dev/hyperload-does-not-exist", &session).is_err());
    }

    #[test]
    fn test_usb_port_info() {
        let info = PortInfo::from(SerialPortInfo {
            port_name: "/dev/ttyUSB0".into(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: 0x10C4,
                pid: 0xEA60,
                serial_number: Some("0001".into()),
                manufacturer: Some("Silicon Labs".into()),
                product: Some("CP2102".into()),
            }),
        });
        assert_eq!(info.name, "/dev/ttyUSB0");
        assert_eq!(info.vid, Some(0x10C4));
        assert_eq!(info.pid, Some(0xEA60));
        assert_eq!(info.product.as_deref(), Some("CP2102"));
        assert_eq!(info.serial_number.as_deref(), Some("0001"));
    }

    #[test]
    fn test_non_usb_port_info() {
        let info = PortInfo::from(SerialPortInfo {
            port_name: "/dev/ttyS0".into(),
            port_type: SerialPortType::Unknown,
        });
        assert_eq!(info.name, "/dev/ttyS0");
        assert!(info.vid.is_none());
        assert!(info.manufacturer.is_none());
    }
}
