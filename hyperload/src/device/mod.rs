//! Serial port discovery and USB bridge classification.
//!
//! Hyperload boards reach the host through a USB-UART bridge whose DTR/RTS
//! lines are wired to reset. Ports behind a known bridge are preferred when
//! no port is given explicitly.

use crate::port::PortInfo;

#[cfg(feature = "native")]
use {
    crate::error::{Error, Result},
    log::{debug, info, trace},
};

/// Known USB-UART bridge kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceKind {
    /// FTDI FT232/FT2232/FT4232.
    Ftdi,
    /// Silicon Labs CP210x.
    Cp210x,
    /// WCH CH340/CH341.
    Ch340,
    /// Prolific PL2303.
    Prolific,
    /// Not a known bridge.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches any product.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && (pids.is_empty() || pids.contains(&pid)))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ftdi => "FTDI",
            Self::Cp210x => "CP210x",
            Self::Ch340 => "CH340/CH341",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether this is a known bridge.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Bridges found on Hyperload development boards.
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::Ftdi | Self::Cp210x)
    }
}

/// A serial port with its bridge classification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectedPort {
    /// Port name/path (e.g. "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified bridge.
    pub device: DeviceKind,
    /// USB vendor ID, if any.
    pub vid: Option<u16>,
    /// USB product ID, if any.
    pub pid: Option<u16>,
    /// Manufacturer string, if any.
    pub manufacturer: Option<String>,
    /// Product string, if any.
    pub product: Option<String>,
    /// Serial number, if any.
    pub serial: Option<String>,
}

impl From<PortInfo> for DetectedPort {
    fn from(info: PortInfo) -> Self {
        let device = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => DeviceKind::from_vid_pid(vid, pid),
            _ => DeviceKind::Unknown,
        };
        Self {
            name: info.name,
            device,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

/// Detect all serial ports.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    match crate::port::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| {
                let detected = DetectedPort::from(info);
                trace!("Found port {} ({:?})", detected.name, detected.device);
                detected
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Pick the best candidate: a board bridge, then any known bridge, then
/// the first port.
pub fn select_port(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    ports
        .iter()
        .find(|p| p.device.is_high_priority())
        .or_else(|| ports.iter().find(|p| p.device.is_known()))
        .or_else(|| ports.first())
}

/// Auto-detect a single port.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let ports = detect_ports();
    let port = select_port(&ports).ok_or(Error::DeviceNotFound)?;
    if port.device.is_known() {
        info!("Auto-detected {} USB-UART bridge: {}", port.device.name(), port.name);
    } else {
        info!("Using first available port: {}", port.name);
    }
    Ok(port.clone())
}

/// Format detected ports for display, one line each.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port.device.is_known() {
                format!(" [{}]", port.device.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };
            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            format!("{}{device_info}{product_info}", port.name)
        })
        .collect()
}
