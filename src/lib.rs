//! This crate talks to register-based devices (sensors, meters, controllers)
//! over a serial line and keeps a local copy of their registers up to date.
//!
//! A [`Device`] opens a transport, answers synchronous register reads and
//! writes, and can run a background poll loop that reads a [`PollPlan`] on a
//! fixed interval. Every poll cycle that reads something hands an owned
//! [`Snapshot`] of the register store to the registered [`UpdateHandler`].
//!
//! Framing is pluggable through the [`Protocol`] trait. Two protocols are
//! bundled:
//! * [`ModbusRtu`]: holding register reads (0x03) and writes (0x06, 0x10)
//!   with CRC-16/MODBUS. This is the default.
//! * [`Sum8Protocol`]: a small `0xA5`-headed frame with an 8-bit additive
//!   checksum, useful as a second protocol in tests.
//!
//! Any interface implementing [`embedded_io::Read`] & [`embedded_io::Write`]
//! can carry frames once it implements [`Transport`]. With the default
//! `serial` feature, [`SerialConnector`](transport::serial::SerialConnector)
//! opens local serial ports through the `serialport` crate, configured like so:
//! * Default baud rate: 9600
//! * Data bits: 8
//! * Stop bits: 1
//! * Parity: None
//!
//! ```no_run
//! use fugit::ExtU32;
//! use regpoll::{ConnectionConfig, Device, PollConfig, PollPlan, Snapshot};
//!
//! # fn main() -> regpoll::Result<()> {
//! let config = ConnectionConfig::new("soil sensor", "/dev/ttyUSB0", 9600, 0x50);
//! let device = Device::serial(config).with_handler(|snapshot: Snapshot| {
//!     println!("{snapshot}");
//! });
//! device.open()?;
//!
//! println!("0x3A = {}", device.read_reg(0x3a)?);
//! device.start_polling(PollConfig::new(PollPlan::register(0x3a)).with_interval(100.millis()))?;
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! device.stop_polling();
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod link;
pub mod poller;
pub mod store;
pub mod transport;

#[cfg(test)]
mod mock_serial;

pub use codec::{ModbusRtu, Protocol, Request, Response, Sum8Protocol};
pub use config::{ConnectionConfig, PollConfig, PollPlan};
pub use device::Device;
#[cfg(feature = "serial")]
pub use device::SerialDevice;
pub use error::{Error, Result};
pub use poller::{PollFailure, PollState, PollStatus, UpdateHandler};
pub use store::{Register, RegisterStore, Snapshot};
pub use transport::{Connector, Transport};
