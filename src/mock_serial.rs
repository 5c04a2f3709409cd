//! We use this mocking module in unit tests to emulate a register device on a
//! serial port.
//!
//! A [`MockBus`] holds the device state and is shared between the test and
//! every [`MockSerial`] opened on it. Each request written to a port is decoded
//! with the bus protocol and answered immediately, unless the bus has been told
//! to misbehave.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::codec::{FrameDecoder, ModbusRtu, Protocol, Request, Response, Values};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::transport::{Connector, Transport};

#[derive(Debug, Default)]
struct BusState {
    registers: BTreeMap<u16, u16>,
    /// Never answer.
    silent: bool,
    /// Answer every request with this exception code.
    exception: Option<u8>,
    /// Number of upcoming replies to send with a broken checksum.
    corrupt_next: usize,
    /// Bytes sent ahead of every reply.
    garbage: Vec<u8>,
    requests: Vec<Request>,
    open_ports: usize,
    connect_error: bool,
    read_error: bool,
    write_error: bool,
}

/// Our simulated device, shared by the test and the ports opened on it.
pub struct MockBus<P: Protocol = ModbusRtu> {
    unit: u8,
    protocol: Arc<P>,
    state: Arc<Mutex<BusState>>,
}

impl<P: Protocol> Clone for MockBus<P> {
    fn clone(&self) -> Self {
        Self {
            unit: self.unit,
            protocol: Arc::clone(&self.protocol),
            state: Arc::clone(&self.state),
        }
    }
}

impl MockBus<ModbusRtu> {
    /// A Modbus RTU device answering as `unit`.
    pub fn new(unit: u8) -> Self {
        Self::with_protocol(unit)
    }
}

impl<P: Protocol + Default> MockBus<P> {
    pub fn with_protocol(unit: u8) -> Self {
        Self {
            unit,
            protocol: Arc::new(P::default()),
            state: Arc::default(),
        }
    }
}

impl<P: Protocol> MockBus<P> {
    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state().registers.insert(address, value);
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.state().registers.get(&address).copied()
    }

    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    pub fn set_exception(&self, code: Option<u8>) {
        self.state().exception = code;
    }

    pub fn corrupt_next(&self, replies: usize) {
        self.state().corrupt_next = replies;
    }

    pub fn set_garbage_prefix(&self, bytes: &[u8]) {
        self.state().garbage = bytes.to_vec();
    }

    /// Every request the device has decoded, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.state().requests.clone()
    }

    pub fn open_ports(&self) -> usize {
        self.state().open_ports
    }

    pub fn set_connect_error(&self, should_error: bool) {
        self.state().connect_error = should_error;
    }

    /// Configure whether read operations should fail with an error
    pub fn set_read_error(&self, should_error: bool) {
        self.state().read_error = should_error;
    }

    /// Configure whether write operations should fail with an error
    pub fn set_write_error(&self, should_error: bool) {
        self.state().write_error = should_error;
    }

    /// Bytes the device sends back for one request, or nothing when silent.
    fn answer(&self, request: &Request) -> Vec<u8> {
        let mut state = self.state();
        state.requests.push(request.clone());
        if state.silent {
            return Vec::new();
        }

        let frame = if let Some(code) = state.exception {
            self.protocol.encode_exception(self.unit, request, code)
        } else {
            let response = match request {
                Request::Read { start, count } => {
                    let values: Values = (*start..=start.saturating_add(count - 1))
                        .map(|address| state.registers.get(&address).copied().unwrap_or_default())
                        .collect();
                    Response::Registers {
                        start: *start,
                        values,
                    }
                }
                Request::Write { start, values } => {
                    for (address, value) in (*start..=u16::MAX).zip(values.iter().copied()) {
                        state.registers.insert(address, value);
                    }
                    Response::Written {
                        start: *start,
                        count: values.len() as u16,
                    }
                }
            };
            self.protocol.encode_response(self.unit, request, &response)
        };

        let mut reply = state.garbage.clone();
        // The mock only encodes what it just decoded.
        reply.extend_from_slice(&frame.unwrap());
        if state.corrupt_next > 0 {
            state.corrupt_next -= 1;
            if let Some(last) = reply.last_mut() {
                *last ^= 0xFF;
            }
        }
        reply
    }
}

/// Our mock type used to emulate a serial port.
pub struct MockSerial<P: Protocol = ModbusRtu> {
    bus: MockBus<P>,
    /// Decodes the requests written to the port
    decoder: FrameDecoder,
    /// Reply bytes not yet read
    pending: VecDeque<u8>,
    read_timeout: Duration,
}

#[derive(Debug)]
pub enum MockSerialError {
    /// Simulated timeout error
    Timeout,
    /// Generic simulated error for testing
    SimulatedError,
}

impl core::fmt::Display for MockSerialError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl core::error::Error for MockSerialError {}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockSerialError::Timeout => embedded_io::ErrorKind::TimedOut,
            MockSerialError::SimulatedError => embedded_io::ErrorKind::Other,
        }
    }
}

impl<P: Protocol> MockSerial<P> {
    fn new(bus: MockBus<P>) -> Self {
        bus.state().open_ports += 1;
        Self {
            bus,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl<P: Protocol> Drop for MockSerial<P> {
    fn drop(&mut self) {
        self.bus.state().open_ports -= 1;
    }
}

impl<P: Protocol> embedded_io::ErrorType for MockSerial<P> {
    type Error = MockSerialError;
}

impl<P: Protocol> embedded_io::Write for MockSerial<P> {
    fn write(&mut self, buf: &[u8]) -> core::result::Result<usize, Self::Error> {
        if self.bus.state().write_error {
            return Err(MockSerialError::SimulatedError);
        }

        self.decoder.feed(buf);
        loop {
            match self.decoder.next_request(&*self.bus.protocol, self.bus.unit) {
                Ok(Some(frame)) if frame.unit == self.bus.unit => {
                    let reply = self.bus.answer(&frame.request);
                    self.pending.extend(reply);
                }
                Ok(Some(_)) | Err(_) => continue,
                Ok(None) => break,
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> core::result::Result<(), Self::Error> {
        if self.bus.state().write_error {
            return Err(MockSerialError::SimulatedError);
        }
        Ok(())
    }
}

impl<P: Protocol> embedded_io::Read for MockSerial<P> {
    fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Self::Error> {
        if self.bus.state().read_error {
            return Err(MockSerialError::SimulatedError);
        }

        if self.pending.is_empty() {
            std::thread::sleep(self.read_timeout);
            return Err(MockSerialError::Timeout);
        }

        let bytes_to_read = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..bytes_to_read)) {
            *slot = byte;
        }
        Ok(bytes_to_read)
    }
}

impl<P: Protocol> Transport for MockSerial<P> {
    fn set_read_timeout(&mut self, timeout: Duration) -> core::result::Result<(), Self::Error> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn discard_input(&mut self) -> core::result::Result<(), Self::Error> {
        self.pending.clear();
        Ok(())
    }
}

/// Opens [`MockSerial`] ports on a shared [`MockBus`].
pub struct MockConnector<P: Protocol = ModbusRtu> {
    bus: MockBus<P>,
}

impl<P: Protocol> MockConnector<P> {
    pub fn new(bus: MockBus<P>) -> Self {
        Self { bus }
    }
}

impl<P: Protocol> Connector for MockConnector<P> {
    type Transport = MockSerial<P>;

    fn connect(&self, config: &ConnectionConfig) -> Result<MockSerial<P>> {
        if self.bus.state().connect_error {
            return Err(Error::Connect {
                port: config.port().to_owned(),
                reason: "Device or resource busy".to_owned(),
            });
        }
        Ok(MockSerial::new(self.bus.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Sum8Protocol;
    use embedded_io::{Error as _, Read, Write};

    fn port(bus: &MockBus) -> MockSerial {
        MockSerial::new(bus.clone())
    }

    fn request_bytes(request: &Request) -> Vec<u8> {
        ModbusRtu.encode_request(0x50, request).unwrap().to_vec()
    }

    #[test]
    fn test_answers_read_request() {
        let bus = MockBus::new(0x50);
        bus.set_register(0x3a, 7);
        let mut mock = port(&bus);

        let request = Request::read(0x3a, 1).unwrap();
        assert_eq!(mock.write(&request_bytes(&request)).unwrap(), 8);

        let mut buffer = [0u8; 16];
        let read = mock.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..read], &[0x50, 0x03, 0x02, 0x00, 0x07, 0x04, 0x4A]);
        assert_eq!(bus.requests(), vec![request]);
    }

    #[test]
    fn test_request_split_across_writes() {
        let bus = MockBus::new(0x50);
        let mut mock = port(&bus);
        let bytes = request_bytes(&Request::write(0x65, &[50]).unwrap());

        mock.write(&bytes[..3]).unwrap();
        assert!(bus.requests().is_empty());
        mock.write(&bytes[3..]).unwrap();
        assert_eq!(bus.register(0x65), Some(50));

        let mut buffer = [0u8; 16];
        let read = mock.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..read], bytes.as_slice());
    }

    #[test]
    fn test_read_partial_data() {
        let bus = MockBus::new(0x50);
        let mut mock = port(&bus);
        mock.write(&request_bytes(&Request::read(0x3a, 1).unwrap()))
            .unwrap();

        let mut buffer1 = [0u8; 5];
        let mut buffer2 = [0u8; 5];
        assert_eq!(mock.read(&mut buffer1).unwrap(), 5);
        assert_eq!(mock.read(&mut buffer2).unwrap(), 2);
        assert_eq!(&buffer1, &[0x50, 0x03, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_ignores_other_units() {
        let bus = MockBus::new(0x50);
        let mut mock = port(&bus);
        let bytes = ModbusRtu
            .encode_request(0x51, &Request::read(0x3a, 1).unwrap())
            .unwrap();
        mock.write(&bytes).unwrap();
        assert!(bus.requests().is_empty());
    }

    #[test]
    fn test_read_timeout_when_no_data() {
        let bus = MockBus::new(0x50);
        let mut mock = port(&bus);
        mock.set_read_timeout(Duration::from_millis(1)).unwrap();

        let mut buffer = [0u8; 10];
        let result = mock.read(&mut buffer);
        assert!(matches!(result, Err(MockSerialError::Timeout)));
    }

    #[test]
    fn test_silent_device_records_request() {
        let bus = MockBus::new(0x50);
        bus.set_silent(true);
        let mut mock = port(&bus);
        mock.set_read_timeout(Duration::from_millis(1)).unwrap();
        mock.write(&request_bytes(&Request::read(0x3a, 1).unwrap()))
            .unwrap();

        let mut buffer = [0u8; 10];
        assert!(mock.read(&mut buffer).is_err());
        assert_eq!(bus.requests().len(), 1);
    }

    #[test]
    fn test_discard_input() {
        let bus = MockBus::new(0x50);
        let mut mock = port(&bus);
        mock.set_read_timeout(Duration::from_millis(1)).unwrap();
        mock.write(&request_bytes(&Request::read(0x3a, 1).unwrap()))
            .unwrap();
        mock.discard_input().unwrap();

        let mut buffer = [0u8; 10];
        assert!(matches!(mock.read(&mut buffer), Err(MockSerialError::Timeout)));
    }

    #[test]
    fn test_error_simulation() {
        let bus = MockBus::new(0x50);
        let mut mock = port(&bus);

        bus.set_write_error(true);
        assert!(matches!(mock.write(b"test"), Err(MockSerialError::SimulatedError)));
        assert!(matches!(mock.flush(), Err(MockSerialError::SimulatedError)));
        bus.set_write_error(false);
        assert!(mock.flush().is_ok());

        bus.set_read_error(true);
        let mut buffer = [0u8; 10];
        assert!(matches!(mock.read(&mut buffer), Err(MockSerialError::SimulatedError)));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(MockSerialError::Timeout.kind(), embedded_io::ErrorKind::TimedOut);
        assert_eq!(MockSerialError::SimulatedError.kind(), embedded_io::ErrorKind::Other);
    }

    #[test]
    fn test_open_port_accounting() {
        let bus = MockBus::new(0x50);
        let connector = MockConnector::new(bus.clone());
        let config = ConnectionConfig::new("mock", "mock0", 9600, 0x50);

        let first = connector.connect(&config).unwrap();
        let second = connector.connect(&config).unwrap();
        assert_eq!(bus.open_ports(), 2);
        drop(first);
        drop(second);
        assert_eq!(bus.open_ports(), 0);

        bus.set_connect_error(true);
        assert!(matches!(connector.connect(&config), Err(Error::Connect { .. })));
    }

    #[test]
    fn test_sum8_bus() {
        let bus = MockBus::<Sum8Protocol>::with_protocol(0x50);
        bus.set_register(0x3a, 7);
        let mut mock = MockSerial::new(bus.clone());
        let bytes = Sum8Protocol
            .encode_request(0x50, &Request::read(0x3a, 1).unwrap())
            .unwrap();
        mock.write(&bytes).unwrap();

        let mut buffer = [0u8; 16];
        let read = mock.read(&mut buffer).unwrap();
        assert_eq!(buffer[0], 0xA5);
        assert_eq!(&buffer[read - 3..read - 1], &[0x00, 0x07]);
    }
}
