//! One request, one reply.
//!
//! A [`Link`] owns the open transport and the stream decoder for one device.
//! The device facade keeps it behind a mutex so the poll loop and synchronous
//! calls never interleave on the wire.

use core::time::Duration;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::codec::{FrameDecoder, MAX_FRAME_LEN, Protocol, Request, Response};
use crate::error::{Error, Result};
use crate::transport::{Connection, Transport};

/// A link shared by the poll loop and synchronous callers; `None` once closed.
pub type SharedLink<P, T> = Arc<Mutex<Option<Link<P, T>>>>;

/// Run `f` with exclusive use of the link.
pub(crate) fn with_link<P, T, R>(
    link: &SharedLink<P, T>,
    f: impl FnOnce(&mut Link<P, T>) -> Result<R>,
) -> Result<R>
where
    P: Protocol,
    T: Transport,
{
    let mut guard = link.lock().unwrap_or_else(PoisonError::into_inner);
    let link = guard.as_mut().ok_or(Error::NotOpen)?;
    f(link)
}

pub struct Link<P: Protocol, T: Transport> {
    protocol: Arc<P>,
    unit: u8,
    connection: Connection<T>,
    decoder: FrameDecoder,
}

impl<P: Protocol, T: Transport> Link<P, T> {
    pub fn new(protocol: Arc<P>, unit: u8, connection: Connection<T>) -> Self {
        Self {
            protocol,
            unit,
            connection,
            decoder: FrameDecoder::new(),
        }
    }

    /// Send `request` and wait up to `timeout` for the matching reply.
    ///
    /// Frames for other units and replies that do not answer `request` are
    /// skipped. If nothing usable arrives in time the last rejection is
    /// returned, or [`Error::Timeout`] when the line stayed quiet. An
    /// exception reply ends the exchange immediately.
    pub fn transact(&mut self, request: &Request, timeout: Duration) -> Result<Response> {
        let frame = self.protocol.encode_request(self.unit, request)?;
        self.decoder.clear();
        self.connection.discard_input()?;
        log::trace!("TX {:02X?}", frame.as_slice());
        self.connection.write_bytes(&frame)?;

        let deadline = Instant::now() + timeout;
        let mut last_error = None;
        let mut buf = [0u8; MAX_FRAME_LEN];
        loop {
            loop {
                match self.decoder.next_frame(&*self.protocol, self.unit) {
                    Ok(Some(frame)) if frame.unit != self.unit => {
                        log::trace!("Ignoring frame for unit 0x{:02X}", frame.unit);
                    }
                    Ok(Some(frame)) => match self.protocol.parse_response(request, &frame) {
                        Ok(response) => return Ok(response),
                        Err(err @ Error::Exception { .. }) => return Err(err),
                        Err(err) => {
                            log::debug!("Unexpected reply to {request:?}: {err}");
                            last_error = Some(err);
                        }
                    },
                    Ok(None) => break,
                    Err(err) => last_error = Some(Error::Frame(err)),
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(last_error.unwrap_or(Error::Timeout));
            }
            match self.connection.read_bytes(&mut buf, remaining) {
                Ok(read) => {
                    log::trace!("RX {:02X?}", &buf[..read]);
                    self.decoder.feed(&buf[..read]);
                }
                Err(Error::Timeout) => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Write `bytes` unframed and collect whatever arrives within `wait`.
    pub fn send_raw(&mut self, bytes: &[u8], wait: Duration) -> Result<Vec<u8>> {
        self.decoder.clear();
        self.connection.discard_input()?;
        log::trace!("TX raw {bytes:02X?}");
        self.connection.write_bytes(bytes)?;

        let deadline = Instant::now() + wait;
        let mut received = Vec::new();
        let mut buf = [0u8; MAX_FRAME_LEN];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.connection.read_bytes(&mut buf, remaining) {
                Ok(read) => received.extend_from_slice(&buf[..read]),
                Err(Error::Timeout) => {}
                Err(err) => return Err(err),
            }
        }
        log::trace!("RX raw {received:02X?}");
        Ok(received)
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub fn close(&mut self) {
        self.connection.close();
    }

    /// Times the decoder had to drop bytes to find a frame boundary.
    pub fn resyncs(&self) -> u64 {
        self.decoder.resyncs()
    }
}
