//! Serial port transport backed by the `serialport` crate.
//!
//! The port should normally be configured with 8 data bits, 1 stop bit and no
//! parity, which is what [`SerialConnector`] opens.

use core::time::Duration;

use serialport::SerialPort;

use super::{Connector, Transport};
use crate::config::{ConnectionConfig, std_duration};
use crate::error::{Error, Result};

/// A serial port usable as a [`Transport`].
pub struct SerialTransport(Box<dyn SerialPort>);

impl SerialTransport {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self(port)
    }
}

/// `std::io::Error` from the port, classified for `embedded_io`.
#[derive(Debug)]
pub struct IoError(std::io::Error);

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        use embedded_io::ErrorKind as Kind;
        use std::io::ErrorKind as StdKind;

        match self.0.kind() {
            StdKind::NotFound => Kind::NotFound,
            StdKind::PermissionDenied => Kind::PermissionDenied,
            StdKind::ConnectionRefused => Kind::ConnectionRefused,
            StdKind::ConnectionReset => Kind::ConnectionReset,
            StdKind::ConnectionAborted => Kind::ConnectionAborted,
            StdKind::NotConnected => Kind::NotConnected,
            StdKind::AddrInUse => Kind::AddrInUse,
            StdKind::AddrNotAvailable => Kind::AddrNotAvailable,
            StdKind::BrokenPipe => Kind::BrokenPipe,
            StdKind::AlreadyExists => Kind::AlreadyExists,
            StdKind::InvalidInput => Kind::InvalidInput,
            StdKind::InvalidData => Kind::InvalidData,
            // Serial drivers report an expired read timeout either way.
            StdKind::TimedOut | StdKind::WouldBlock => Kind::TimedOut,
            StdKind::Interrupted => Kind::Interrupted,
            StdKind::Unsupported => Kind::Unsupported,
            StdKind::OutOfMemory => Kind::OutOfMemory,
            _ => Kind::Other,
        }
    }
}

impl embedded_io::ErrorType for SerialTransport {
    type Error = IoError;
}

impl embedded_io::Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Self::Error> {
        std::io::Read::read(&mut self.0, buf).map_err(IoError)
    }
}

impl embedded_io::Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> core::result::Result<usize, Self::Error> {
        std::io::Write::write(&mut self.0, buf).map_err(IoError)
    }

    fn flush(&mut self) -> core::result::Result<(), Self::Error> {
        std::io::Write::flush(&mut self.0).map_err(IoError)
    }
}

impl Transport for SerialTransport {
    fn set_read_timeout(&mut self, timeout: Duration) -> core::result::Result<(), Self::Error> {
        self.0
            .set_timeout(timeout)
            .map_err(|e| IoError(std::io::Error::from(e)))
    }

    fn discard_input(&mut self) -> core::result::Result<(), Self::Error> {
        self.0
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| IoError(std::io::Error::from(e)))
    }
}

/// Opens [`SerialTransport`]s by port name.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    type Transport = SerialTransport;

    fn connect(&self, config: &ConnectionConfig) -> Result<SerialTransport> {
        serialport::new(config.port(), config.baud_rate())
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(std_duration(config.timeout()))
            .open()
            .map(SerialTransport)
            .map_err(|e| Error::Connect {
                port: config.port().to_owned(),
                reason: e.to_string(),
            })
    }
}

/// Names of the serial ports present on this machine.
pub fn available_ports() -> Result<Vec<String>> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .map_err(|e| Error::Connect {
            port: String::new(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::Error as _;

    #[test]
    fn io_error_kinds() {
        let kind = |k: std::io::ErrorKind| IoError(std::io::Error::from(k)).kind();
        assert_eq!(kind(std::io::ErrorKind::TimedOut), embedded_io::ErrorKind::TimedOut);
        assert_eq!(kind(std::io::ErrorKind::WouldBlock), embedded_io::ErrorKind::TimedOut);
        assert_eq!(kind(std::io::ErrorKind::NotFound), embedded_io::ErrorKind::NotFound);
        assert_eq!(
            kind(std::io::ErrorKind::PermissionDenied),
            embedded_io::ErrorKind::PermissionDenied
        );
        assert_eq!(kind(std::io::ErrorKind::UnexpectedEof), embedded_io::ErrorKind::Other);
    }

    #[test]
    fn missing_port_is_connect_error() {
        let config = ConnectionConfig::new("missing", "/dev/regpoll-does-not-exist", 9600, 0x50);
        assert!(matches!(
            SerialConnector.connect(&config),
            Err(Error::Connect { .. })
        ));
    }
}
