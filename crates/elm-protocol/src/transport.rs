//! Serial transport abstraction
//!
//! The connection manager only ever talks to an adapter through the narrow
//! [`Transport`] trait. [`SerialTransport`] backs it with a real port; the
//! simulator in [`crate::sim`] backs it with memory.

use crate::error::ProtocolError;
use std::cmp::Ordering;
use std::io::{Read, Write};
use std::time::Duration;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPort, SerialPortInfo, SerialPortType, StopBits};
use tracing::{debug, info, warn};

/// Default baud rate for ELM327 adapters
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Default blocking read timeout
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

/// Line settings applied when a transport is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
    /// Upper bound for a blocking read
    pub read_timeout: Duration,
}

impl PortSettings {
    /// 8N1, no flow control: the framing every ELM327 expects
    pub fn elm327(baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            baud_rate,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
            read_timeout,
        }
    }
}

impl Default for PortSettings {
    fn default() -> Self {
        Self::elm327(
            DEFAULT_BAUD_RATE,
            Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        )
    }
}

/// Byte-oriented device an adapter is reached through
pub trait Transport: Send + 'static {
    /// Human readable name used in logs
    fn name(&self) -> &str;

    /// Open the device with the given line settings
    fn open(&mut self, settings: &PortSettings) -> Result<(), ProtocolError>;

    /// Number of bytes that can be read without blocking
    fn bytes_available(&mut self) -> Result<usize, ProtocolError>;

    /// Read into `buf`, returning the number of bytes read
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError>;

    /// Write all of `buf`, returning the number of bytes written
    fn write_bytes(&mut self, buf: &[u8]) -> Result<usize, ProtocolError>;

    /// Close the device. Closing a closed transport is a no-op.
    fn close(&mut self);

    /// Whether the device is currently open
    fn is_open(&self) -> bool;

    /// Read whatever is available right now in one shot.
    ///
    /// Returns `None` when nothing is pending. Bytes that arrive after the
    /// snapshot are left for the next call.
    fn read_available(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let available = self.bytes_available()?;
        if available == 0 {
            return Ok(None);
        }

        let mut buf = vec![0u8; available];
        let read = self.read_bytes(&mut buf)?;
        buf.truncate(read);
        Ok(Some(buf))
    }
}

/// [`Transport`] over a named serial port
pub struct SerialTransport {
    /// Device path (e.g., "/dev/ttyUSB0" or "COM3")
    path: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Transport for the port at `path`; nothing is opened yet
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            port: None,
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, ProtocolError> {
        self.port.as_mut().ok_or(ProtocolError::NotOpen)
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.path
    }

    fn open(&mut self, settings: &PortSettings) -> Result<(), ProtocolError> {
        self.close();

        let port = tokio_serial::new(&self.path, settings.baud_rate)
            .data_bits(settings.data_bits)
            .stop_bits(settings.stop_bits)
            .parity(settings.parity)
            .flow_control(settings.flow_control)
            .timeout(settings.read_timeout)
            .open()
            .map_err(|e| ProtocolError::Open {
                port: self.path.clone(),
                reason: e.to_string(),
            })?;

        info!("Opened {} at {} baud", self.path, settings.baud_rate);
        self.port = Some(port);
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize, ProtocolError> {
        Ok(self.port()?.bytes_to_read()? as usize)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        Ok(self.port()?.read(buf)?)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<usize, ProtocolError> {
        let port = self.port()?;
        port.write_all(buf)?;
        port.flush()?;
        Ok(buf.len())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed {}", self.path);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

/// A serial port found on this machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Device path, e.g. "/dev/ttyUSB0" or "COM3"
    pub name: String,
    /// USB vendor and product IDs, for USB-serial bridges
    pub usb_ids: Option<(u16, u16)>,
    /// USB product string, when the bridge reports one
    pub product: Option<String>,
}

impl PortInfo {
    /// Whether the port sits behind a USB-serial bridge, as most ELM327
    /// cables do
    pub fn is_usb(&self) -> bool {
        self.usb_ids.is_some()
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (usb_ids, product) = match info.port_type {
            SerialPortType::UsbPort(usb) => (Some((usb.vid, usb.pid)), usb.product),
            _ => (None, None),
        };
        Self {
            name: info.port_name,
            usb_ids,
            product,
        }
    }
}

/// Split "ttyUSB10" into ("ttyUSB", Some(10)) so numbered ports compare numerically
fn name_parts(name: &str) -> (&str, Option<u32>) {
    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
    (stem, name[stem.len()..].parse().ok())
}

/// USB ports first, then by name with numeric suffixes in numeric order
fn port_order(a: &PortInfo, b: &PortInfo) -> Ordering {
    b.is_usb()
        .cmp(&a.is_usb())
        .then_with(|| name_parts(&a.name).cmp(&name_parts(&b.name)))
}

/// List serial ports an adapter could be attached to
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = match tokio_serial::available_ports() {
        Ok(found) => found.into_iter().map(PortInfo::from).collect(),
        Err(e) => {
            warn!("Serial port enumeration failed: {}", e);
            Vec::new()
        }
    };
    ports.sort_by(port_order);
    ports.dedup_by(|a, b| a.name == b.name);
    debug!("Found {} serial ports", ports.len());
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elm327_settings_are_8n1() {
        let settings = PortSettings::elm327(115200, Duration::from_millis(500));
        assert_eq!(settings.baud_rate, 115200);
        assert_eq!(settings.data_bits, DataBits::Eight);
        assert_eq!(settings.stop_bits, StopBits::One);
        assert_eq!(settings.parity, Parity::None);
        assert_eq!(settings.flow_control, FlowControl::None);
        assert_eq!(settings.read_timeout, Duration::from_millis(500));
    }

    fn port(name: &str, usb: bool) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            usb_ids: usb.then_some((0x0403, 0x6001)),
            product: None,
        }
    }

    #[test]
    fn test_usb_ports_listed_first_in_numeric_order() {
        let mut ports = vec![
            port("/dev/ttyS0", false),
            port("/dev/ttyUSB10", true),
            port("/dev/ttyACM0", true),
            port("/dev/ttyUSB2", true),
            port("/dev/ttyS1", false),
        ];
        ports.sort_by(port_order);

        let names: Vec<&str> = ports.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "/dev/ttyACM0",
                "/dev/ttyUSB2",
                "/dev/ttyUSB10",
                "/dev/ttyS0",
                "/dev/ttyS1",
            ]
        );
    }

    #[test]
    fn test_name_parts_split_numeric_suffix() {
        assert_eq!(name_parts("COM3"), ("COM", Some(3)));
        assert_eq!(name_parts("/dev/rfcomm"), ("/dev/rfcomm", None));
    }

    #[test]
    fn test_serial_transport_starts_closed() {
        let mut transport = SerialTransport::new("/dev/does-not-exist");
        assert!(!transport.is_open());
        assert!(matches!(
            transport.bytes_available(),
            Err(ProtocolError::NotOpen)
        ));
        assert!(matches!(
            transport.write_bytes(b"ATZ\r"),
            Err(ProtocolError::NotOpen)
        ));
    }

    #[test]
    fn test_open_missing_port_fails() {
        let mut transport = SerialTransport::new("/dev/does-not-exist");
        let result = transport.open(&PortSettings::default());
        assert!(matches!(result, Err(ProtocolError::Open { .. })));
        assert!(!transport.is_open());
    }
}
