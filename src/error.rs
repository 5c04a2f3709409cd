//! Our error types for register device communication.

use thiserror::Error;

use crate::codec::FrameError;

pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised while talking to a register device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The transport could not be opened (bad path, permissions, port busy).
    #[error("Unable to open {port}: {reason}")]
    Connect { port: String, reason: String },
    #[error("Serial communication error: {0:?}")]
    SerialError(embedded_io::ErrorKind),
    #[error("Communication timeout")]
    Timeout,
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Modbus protocol error: {0:?}")]
    ModbusError(rmodbus::ErrorKind),
    /// The device answered with an exception frame.
    #[error("Device exception 0x{code:02X} for function 0x{function:02X}")]
    Exception { function: u8, code: u8 },
    #[error("Invalid response received")]
    InvalidResponse,
    #[error("Invalid range")]
    InvalidRange,
    #[error("Frame buffer capacity exceeded")]
    BufferError,
    #[error("Device is not open")]
    NotOpen,
    #[error("Polling is already running")]
    AlreadyRunning,
    #[error("Polling is not running")]
    NotRunning,
    #[error("Unable to start polling thread: {0}")]
    Thread(String),
}

impl Error {
    /// Errors the poll loop absorbs and retries rather than surfacing immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout
                | Error::Frame(_)
                | Error::SerialError(_)
                | Error::Exception { .. }
                | Error::InvalidResponse
        )
    }
}

impl From<rmodbus::ErrorKind> for Error {
    fn from(err: rmodbus::ErrorKind) -> Self {
        Error::ModbusError(err)
    }
}
