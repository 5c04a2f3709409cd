use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fugit::MillisDurationU32;

use crate::codec::{FrameDecoder, ModbusRtu, Protocol, Request, Response};
use crate::config::{ConnectionConfig, PollConfig, std_duration};
use crate::error::{Error, Result};
use crate::link::{Link, SharedLink, with_link};
use crate::poller::{PollContext, PollStatus, Poller, SharedHandler, UpdateHandler};
use crate::store::{RegisterStore, Snapshot};
use crate::transport::{Connection, Connector};

/// One register device behind a transport.
///
/// Synchronous reads and writes make a single bounded attempt and share the
/// link with the poll loop, one exchange at a time. Every successful read or
/// acknowledged write is mirrored in the device's register store, which
/// [`Self::get`] and [`Self::snapshot`] read without touching the wire.
///
/// `read_*` methods go to the device; `get` only looks at the last value seen.
pub struct Device<C: Connector, P: Protocol = ModbusRtu> {
    config: ConnectionConfig,
    connector: C,
    protocol: Arc<P>,
    link: SharedLink<P, C::Transport>,
    store: Arc<RegisterStore>,
    handler: SharedHandler,
    poller: Poller,
}

/// A Modbus RTU device on a local serial port.
#[cfg(feature = "serial")]
pub type SerialDevice = Device<crate::transport::serial::SerialConnector>;

#[cfg(feature = "serial")]
impl Device<crate::transport::serial::SerialConnector> {
    pub fn serial(config: ConnectionConfig) -> Self {
        Self::new(config, crate::transport::serial::SerialConnector)
    }
}

impl<C: Connector> Device<C> {
    /// A Modbus RTU device. Nothing is opened until [`Self::open`].
    pub fn new(config: ConnectionConfig, connector: C) -> Self {
        Self::with_protocol(config, connector, ModbusRtu)
    }
}

impl<C: Connector, P: Protocol> Device<C, P> {
    pub fn with_protocol(config: ConnectionConfig, connector: C, protocol: P) -> Self {
        Self {
            config,
            connector,
            protocol: Arc::new(protocol),
            link: Arc::new(Mutex::new(None)),
            store: Arc::new(RegisterStore::new()),
            handler: Arc::new(Mutex::new(None)),
            poller: Poller::new(),
        }
    }

    pub fn with_handler(self, handler: impl UpdateHandler) -> Self {
        self.register_handler(handler);
        self
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<Link<P, C::Transport>>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the transport. Does nothing if already open.
    pub fn open(&self) -> Result<()> {
        let mut link = self.lock_link();
        if link.is_some() {
            return Ok(());
        }
        let connection = Connection::open(&self.connector, &self.config)?;
        *link = Some(Link::new(
            Arc::clone(&self.protocol),
            self.config.unit_id(),
            connection,
        ));
        log::info!("{} open on {}", self.config.name(), self.config.port());
        Ok(())
    }

    /// Stop polling, release the transport and forget every register.
    pub fn close(&self) {
        self.poller.stop();
        if let Some(mut link) = self.lock_link().take() {
            link.close();
            log::info!("{} closed", self.config.name());
        }
        self.store.clear();
    }

    pub fn is_open(&self) -> bool {
        self.lock_link().as_ref().is_some_and(Link::is_open)
    }

    /// Start the background poll loop.
    pub fn start_polling(&self, config: PollConfig) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotOpen);
        }
        self.poller.start(
            config,
            PollContext {
                name: self.config.name().to_owned(),
                link: Arc::clone(&self.link),
                store: Arc::clone(&self.store),
                handler: Arc::clone(&self.handler),
            },
        )
    }

    /// Stop the poll loop and wait for it to exit. The device stays open.
    pub fn stop_polling(&self) {
        self.poller.stop();
    }

    pub fn pause_polling(&self) -> Result<()> {
        self.poller.pause()
    }

    pub fn resume_polling(&self) -> Result<()> {
        self.poller.resume()
    }

    pub fn poll_status(&self) -> PollStatus {
        self.poller.status()
    }

    fn transact(&self, request: &Request) -> Result<Response> {
        let timeout = std_duration(self.config.timeout());
        with_link(&self.link, |link| link.transact(request, timeout))
    }

    /// Read `count` registers starting at `start`.
    pub fn read_regs(&self, start: u16, count: u16) -> Result<Vec<u16>> {
        let request = Request::read(start, count)?;
        match self.transact(&request)? {
            Response::Registers { values, .. } => {
                self.store.update_block(start, &values);
                Ok(values.to_vec())
            }
            Response::Written { .. } => Err(Error::InvalidResponse),
        }
    }

    pub fn read_reg(&self, address: u16) -> Result<u16> {
        self.read_regs(address, 1)?
            .first()
            .copied()
            .ok_or(Error::InvalidResponse)
    }

    pub fn write_reg(&self, address: u16, value: u16) -> Result<()> {
        self.write_regs(address, &[value])
    }

    /// Write consecutive registers. The store is updated once the device acknowledges.
    pub fn write_regs(&self, start: u16, values: &[u16]) -> Result<()> {
        let request = Request::write(start, values)?;
        match self.transact(&request)? {
            Response::Written { .. } => {
                self.store.update_block(start, values);
                Ok(())
            }
            Response::Registers { .. } => Err(Error::InvalidResponse),
        }
    }

    /// Last value seen for `address`. Never blocks on the wire.
    pub fn get(&self, address: u16) -> Option<u16> {
        self.store.get(address)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    /// Replace the update handler.
    pub fn register_handler(&self, handler: impl UpdateHandler) {
        let handler: Box<dyn UpdateHandler> = Box::new(handler);
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn clear_handler(&self) {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Write pre-built bytes and return everything received within `wait`.
    ///
    /// If the bytes form a request for this device and a valid reply comes
    /// back, the register store is updated as for a normal read or write.
    pub fn send_raw(&self, bytes: &[u8], wait: MillisDurationU32) -> Result<Vec<u8>> {
        let reply = with_link(&self.link, |link| link.send_raw(bytes, std_duration(wait)))?;
        self.absorb_raw(bytes, &reply);
        Ok(reply)
    }

    fn absorb_raw(&self, sent: &[u8], reply: &[u8]) {
        let unit = self.config.unit_id();
        let mut decoder = FrameDecoder::new();
        decoder.feed(sent);
        let Ok(Some(request)) = decoder.next_request(&*self.protocol, unit) else {
            return;
        };
        if request.unit != unit {
            return;
        }

        decoder.clear();
        decoder.feed(reply);
        loop {
            match decoder.next_frame(&*self.protocol, unit) {
                Ok(Some(frame)) if frame.unit == unit => {
                    match self.protocol.parse_response(&request.request, &frame) {
                        Ok(Response::Registers { start, values }) => {
                            self.store.update_block(start, &values);
                        }
                        Ok(Response::Written { start, .. }) => {
                            if let Request::Write { values, .. } = &request.request {
                                self.store.update_block(start, values);
                            }
                        }
                        Err(_) => continue,
                    }
                    return;
                }
                Ok(Some(_)) | Err(_) => continue,
                Ok(None) => return,
            }
        }
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }
}

impl<C: Connector, P: Protocol> Drop for Device<C, P> {
    fn drop(&mut self) {
        self.close();
    }
}
