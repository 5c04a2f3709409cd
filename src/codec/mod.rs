//! Wire framing for register protocols.
//!
//! A [`Protocol`] turns register [`Request`]s into bytes and bytes back into
//! checksum-validated [`Frame`]s. Decoding never blocks: a protocol looks at the
//! bytes received so far and either returns a complete frame, asks for more
//! bytes, or rejects the data. [`FrameDecoder`] drives a protocol over a
//! streaming buffer and resynchronizes after corrupt or foreign bytes.

pub mod checksum;
pub mod rtu;
pub mod sum8;

use strum_macros::{Display, EnumIter};
use thiserror::Error;

use crate::error::{Error, Result};

pub use checksum::Checksum;
pub use rtu::ModbusRtu;
pub use sum8::Sum8Protocol;

/// Largest frame either protocol puts on the wire: a full sum8 read reply,
/// one byte over the 256 byte Modbus RTU limit.
pub const MAX_FRAME_LEN: usize = 257;
/// Most registers a single read may request.
pub const MAX_READ_REGISTERS: u16 = 125;
/// Most registers a single write may carry.
pub const MAX_WRITE_REGISTERS: usize = 123;

const DECODER_CAPACITY: usize = 2 * MAX_FRAME_LEN;

pub type FrameBuf = heapless::Vec<u8, MAX_FRAME_LEN>;
pub type Values = heapless::Vec<u16, { MAX_READ_REGISTERS as usize }>;

/// Function codes shared by the bundled protocols.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumIter)]
#[repr(u8)]
pub enum Function {
    #[strum(to_string = "read holding registers")]
    ReadHolding = 0x03,
    #[strum(to_string = "write single register")]
    WriteSingle = 0x06,
    #[strum(to_string = "write multiple registers")]
    WriteMultiple = 0x10,
}

impl Function {
    /// Bit set on the function code of an exception reply.
    pub const EXCEPTION_FLAG: u8 = 0x80;
}

impl From<Function> for u8 {
    fn from(value: Function) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for Function {
    type Error = FrameError;

    fn try_from(value: u8) -> core::result::Result<Self, Self::Error> {
        match value {
            0x03 => Ok(Function::ReadHolding),
            0x06 => Ok(Function::WriteSingle),
            0x10 => Ok(Function::WriteMultiple),
            other => Err(FrameError::Function(other)),
        }
    }
}

/// Reasons a run of bytes is not a valid frame.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("checksum mismatch (computed 0x{computed:04X}, received 0x{received:04X})")]
    Checksum { computed: u16, received: u16 },
    #[error("malformed length {0}")]
    Length(usize),
    #[error("unsupported function code 0x{0:02X}")]
    Function(u8),
    #[error("unexpected header byte 0x{0:02X}")]
    Header(u8),
}

/// A register operation addressed to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Read { start: u16, count: u16 },
    Write { start: u16, values: Values },
}

impl Request {
    pub fn read(start: u16, count: u16) -> Result<Self> {
        if count == 0 || count > MAX_READ_REGISTERS || start.checked_add(count - 1).is_none() {
            return Err(Error::InvalidRange);
        }
        Ok(Request::Read { start, count })
    }

    pub fn write(start: u16, values: &[u16]) -> Result<Self> {
        if values.is_empty()
            || values.len() > MAX_WRITE_REGISTERS
            || start.checked_add(values.len() as u16 - 1).is_none()
        {
            return Err(Error::InvalidRange);
        }
        let values = Values::from_slice(values).map_err(|_| Error::InvalidRange)?;
        Ok(Request::Write { start, values })
    }

    pub fn start(&self) -> u16 {
        match self {
            Request::Read { start, .. } | Request::Write { start, .. } => *start,
        }
    }

    /// Number of registers touched.
    pub fn count(&self) -> u16 {
        match self {
            Request::Read { count, .. } => *count,
            Request::Write { values, .. } => values.len() as u16,
        }
    }
}

/// The meaning of a successful reply, in the context of its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Registers { start: u16, values: Values },
    Written { start: u16, count: u16 },
}

/// A complete frame whose checksum has been verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub unit: u8,
    pub function: u8,
    /// Bytes between the function code and the checksum, framing fields excluded.
    pub payload: FrameBuf,
}

impl Frame {
    pub fn is_exception(&self) -> bool {
        self.function & Function::EXCEPTION_FLAG != 0
    }
}

/// A request as seen by the device side of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub unit: u8,
    pub request: Request,
}

/// Outcome of looking at a buffer that may hold a frame at its start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T = Frame> {
    Complete { frame: T, consumed: usize },
    Incomplete,
}

/// A register protocol: layout, checksum and request/response semantics.
///
/// Implementations must apply the same checksum on every encode and decode
/// path. Both directions are provided so a link can be simulated end to end.
pub trait Protocol: Send + Sync + 'static {
    fn checksum(&self) -> Checksum;

    /// Whether a frame for `unit` may begin with `byte`. Used to resynchronize.
    fn is_frame_start(&self, byte: u8, unit: u8) -> bool;

    fn encode_request(&self, unit: u8, request: &Request) -> Result<FrameBuf>;

    /// Decode a reply frame starting at `buf[0]`.
    fn decode_response(&self, buf: &[u8]) -> core::result::Result<Decoded, FrameError>;

    /// Interpret a reply frame as the answer to `request`.
    fn parse_response(&self, request: &Request, frame: &Frame) -> Result<Response>;

    /// Decode a request frame starting at `buf[0]`.
    fn decode_request(&self, buf: &[u8])
    -> core::result::Result<Decoded<RequestFrame>, FrameError>;

    fn encode_response(&self, unit: u8, request: &Request, response: &Response)
    -> Result<FrameBuf>;

    fn encode_exception(&self, unit: u8, request: &Request, code: u8) -> Result<FrameBuf>;
}

/// Pulls frames out of a byte stream that may start mid-frame or carry noise.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: heapless::Vec<u8, DECODER_CAPACITY>,
    resyncs: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes. When the buffer would overflow the oldest bytes are dropped.
    pub fn feed(&mut self, bytes: &[u8]) {
        let bytes = if bytes.len() > DECODER_CAPACITY {
            &bytes[bytes.len() - DECODER_CAPACITY..]
        } else {
            bytes
        };
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(DECODER_CAPACITY);
        if overflow > 0 {
            log::warn!("Decoder buffer full, dropping {overflow} stale bytes");
            self.discard(overflow);
            self.resyncs += 1;
        }
        // Room was made above.
        let _ = self.buf.extend_from_slice(bytes);
    }

    /// Next reply frame for `unit`, `Ok(None)` when more bytes are needed.
    ///
    /// A `FrameError` is returned once per rejected candidate; the offending
    /// bytes are already skipped, so calling again continues with the rest.
    pub fn next_frame<P: Protocol + ?Sized>(
        &mut self,
        protocol: &P,
        unit: u8,
    ) -> core::result::Result<Option<Frame>, FrameError> {
        self.next_with(
            |bytes| protocol.decode_response(bytes),
            |byte| protocol.is_frame_start(byte, unit),
        )
    }

    /// Next request frame for `unit`; the device-side counterpart of [`Self::next_frame`].
    pub fn next_request<P: Protocol + ?Sized>(
        &mut self,
        protocol: &P,
        unit: u8,
    ) -> core::result::Result<Option<RequestFrame>, FrameError> {
        self.next_with(
            |bytes| protocol.decode_request(bytes),
            |byte| protocol.is_frame_start(byte, unit),
        )
    }

    fn next_with<T>(
        &mut self,
        decode: impl Fn(&[u8]) -> core::result::Result<Decoded<T>, FrameError>,
        is_start: impl Fn(u8) -> bool,
    ) -> core::result::Result<Option<T>, FrameError> {
        loop {
            let Some(&first) = self.buf.first() else {
                return Ok(None);
            };
            if !is_start(first) {
                let skip = self.next_start(0, &is_start);
                log::trace!("Skipping {skip} bytes with no frame header");
                self.discard(skip);
                self.resyncs += 1;
                continue;
            }

            match decode(self.buf.as_slice()) {
                Ok(Decoded::Complete { frame, consumed }) => {
                    self.discard(consumed);
                    return Ok(Some(frame));
                }
                Ok(Decoded::Incomplete) => {
                    // A header-like byte in noise can claim a long frame; look for a
                    // complete frame further in before waiting for more bytes.
                    let mut at = self.next_start(0, &is_start);
                    while at < self.buf.len() {
                        if let Ok(Decoded::Complete { frame, consumed }) = decode(&self.buf[at..]) {
                            log::debug!("Resynchronized past {at} bytes");
                            self.discard(at + consumed);
                            self.resyncs += 1;
                            return Ok(Some(frame));
                        }
                        at = self.next_start(at, &is_start);
                    }
                    return Ok(None);
                }
                Err(err) => {
                    let skip = self.next_start(0, &is_start);
                    log::debug!("Discarding {skip} bytes: {err}");
                    self.discard(skip);
                    self.resyncs += 1;
                    return Err(err);
                }
            }
        }
    }

    /// Offset of the first plausible header strictly after `from`, or the buffer length.
    fn next_start(&self, from: usize, is_start: impl Fn(u8) -> bool) -> usize {
        self.buf
            .iter()
            .enumerate()
            .skip(from + 1)
            .find(|(_, b)| is_start(**b))
            .map(|(i, _)| i)
            .unwrap_or(self.buf.len())
    }

    fn discard(&mut self, count: usize) {
        let count = count.min(self.buf.len());
        self.buf.rotate_left(count);
        let keep = self.buf.len() - count;
        self.buf.truncate(keep);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Bytes buffered but not yet part of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// How many times bytes were thrown away to regain frame alignment.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }
}

/// Big-endian register values from a data field of even length.
pub(crate) fn registers_from_bytes(data: &[u8]) -> Option<Values> {
    if data.len() % 2 != 0 {
        return None;
    }
    data.chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .try_fold(Values::new(), |mut values, value| {
            values.push(value).ok()?;
            Some(values)
        })
}

pub(crate) fn push_bytes(frame: &mut FrameBuf, bytes: &[u8]) -> Result<()> {
    frame.extend_from_slice(bytes).map_err(|_| Error::BufferError)
}
