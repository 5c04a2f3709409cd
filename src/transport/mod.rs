//! Byte transports.
//!
//! Any interface implementing [`embedded_io::Read`] & [`embedded_io::Write`]
//! can carry frames once it also implements [`Transport`]. A read that returns
//! `Ok(0)` or fails with [`embedded_io::ErrorKind::TimedOut`] is treated as
//! "nothing arrived in time".

#[cfg(feature = "serial")]
pub mod serial;

use core::time::Duration;

use embedded_io::Error as _;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// A blocking byte stream with a bounded read wait.
pub trait Transport: embedded_io::Read + embedded_io::Write + Send + 'static {
    /// Bound how long the next `read` may block.
    fn set_read_timeout(&mut self, timeout: Duration) -> core::result::Result<(), Self::Error>;

    /// Drop bytes that arrived but were never read.
    fn discard_input(&mut self) -> core::result::Result<(), Self::Error> {
        Ok(())
    }
}

/// Opens transports for a [`ConnectionConfig`].
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Fails with [`Error::Connect`] when the port cannot be opened.
    fn connect(&self, config: &ConnectionConfig) -> Result<Self::Transport>;
}

/// An open transport. Closing is idempotent and also happens on drop.
pub struct Connection<T: Transport> {
    port: String,
    transport: Option<T>,
}

impl<T: Transport> Connection<T> {
    pub fn open<C>(connector: &C, config: &ConnectionConfig) -> Result<Self>
    where
        C: Connector<Transport = T>,
    {
        let transport = connector.connect(config)?;
        log::debug!("Opened {} at {} baud", config.port(), config.baud_rate());
        Ok(Self {
            port: config.port().to_owned(),
            transport: Some(transport),
        })
    }

    fn transport(&mut self) -> Result<&mut T> {
        self.transport.as_mut().ok_or(Error::NotOpen)
    }

    /// Read whatever arrives within `timeout`; at least one byte on success.
    pub fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let transport = self.transport()?;
        transport
            .set_read_timeout(timeout)
            .map_err(|e| Error::SerialError(e.kind()))?;
        match transport.read(buf) {
            Ok(0) => Err(Error::Timeout),
            Ok(read) => Ok(read),
            Err(e) => match e.kind() {
                embedded_io::ErrorKind::TimedOut | embedded_io::ErrorKind::Interrupted => {
                    Err(Error::Timeout)
                }
                kind => Err(Error::SerialError(kind)),
            },
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let transport = self.transport()?;
        transport
            .write_all(bytes)
            .map_err(|e| Error::SerialError(e.kind()))?;
        transport.flush().map_err(|e| Error::SerialError(e.kind()))
    }

    pub fn discard_input(&mut self) -> Result<()> {
        self.transport()?
            .discard_input()
            .map_err(|e| Error::SerialError(e.kind()))
    }

    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            log::debug!("Closed {}", self.port);
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn port(&self) -> &str {
        &self.port
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        self.close();
    }
}
