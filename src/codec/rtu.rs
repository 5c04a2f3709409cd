//! Modbus RTU framing.
//!
//! Requests are generated and replies sized and parsed with `rmodbus`. The
//! device side of a link (request decode, reply encode) uses the crate's own
//! CRC-16/MODBUS. All multi-byte fields are big-endian except the CRC, which
//! is sent low byte first.
//!
//! | function | request | reply |
//! |---|---|---|
//! | `0x03` | `unit 03 start:2 count:2 crc:2` | `unit 03 n data[n] crc:2` |
//! | `0x06` | `unit 06 reg:2 value:2 crc:2` | echo of the request |
//! | `0x10` | `unit 10 start:2 qty:2 n data[n] crc:2` | `unit 10 start:2 qty:2 crc:2` |
//! | exception | | `unit fc|80 code crc:2` |

use super::{
    Checksum, Decoded, Frame, FrameBuf, FrameError, Function, MAX_READ_REGISTERS,
    MAX_WRITE_REGISTERS, Protocol, Request, RequestFrame, Response, Values, push_bytes,
    registers_from_bytes,
};
use crate::error::{Error, Result};
use rmodbus::ModbusProto;
use rmodbus::client::ModbusRequest;

const CHECKSUM: Checksum = Checksum::Crc16Modbus;
const CRC_LEN: usize = CHECKSUM.len();
/// Unit, function, four field bytes and the CRC.
const FIXED_FRAME_LEN: usize = 8;

/// Modbus RTU over a serial line. The unit address is the resync anchor.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModbusRtu;

impl ModbusRtu {
    fn function_for(request: &Request) -> Function {
        match request {
            Request::Read { .. } => Function::ReadHolding,
            Request::Write { values, .. } if values.len() == 1 => Function::WriteSingle,
            Request::Write { .. } => Function::WriteMultiple,
        }
    }

    /// Verify the CRC of `buf[..len]` and split off unit, function and payload.
    fn checked_frame(buf: &[u8], len: usize) -> core::result::Result<Decoded, FrameError> {
        if buf.len() < len {
            return Ok(Decoded::Incomplete);
        }
        let body = &buf[..len - CRC_LEN];
        let computed = CHECKSUM.compute(body);
        let received = CHECKSUM.read(&buf[len - CRC_LEN..len]);
        if computed != received {
            return Err(FrameError::Checksum { computed, received });
        }
        let payload = FrameBuf::from_slice(&body[2..]).map_err(|_| FrameError::Length(len))?;
        Ok(Decoded::Complete {
            frame: Frame {
                unit: buf[0],
                function: buf[1],
                payload,
            },
            consumed: len,
        })
    }

    /// An `rmodbus` client primed for `request`, and the request bytes.
    fn client(unit: u8, request: &Request) -> Result<(ModbusRequest, FrameBuf)> {
        let mut buff = FrameBuf::new();
        let mut req = ModbusRequest::new(unit, ModbusProto::Rtu);
        match request {
            Request::Read { start, count } => req.generate_get_holdings(*start, *count, &mut buff)?,
            Request::Write { start, values } if values.len() == 1 => {
                req.generate_set_holding(*start, values[0], &mut buff)?
            }
            Request::Write { start, values } => {
                req.generate_set_holdings_bulk(*start, values.as_slice(), &mut buff)?
            }
        }
        Ok((req, buff))
    }

    /// The frame as it came off the wire, CRC included.
    fn wire(frame: &Frame) -> Result<FrameBuf> {
        let mut buff = FrameBuf::new();
        push_bytes(&mut buff, &[frame.unit, frame.function])?;
        push_bytes(&mut buff, &frame.payload)?;
        CHECKSUM.append(&mut buff)?;
        Ok(buff)
    }

    /// Map an `rmodbus` parse failure. Exception codes are kept as sent.
    fn rejected(function: Function, frame: &Frame, err: rmodbus::ErrorKind) -> Error {
        let exception = err.is_modbus_error() || err == rmodbus::ErrorKind::UnknownError;
        if frame.is_exception() && exception {
            Error::Exception {
                function: function.into(),
                code: frame.payload.first().copied().unwrap_or_default(),
            }
        } else {
            log::trace!("Reply rejected: {err}");
            Error::InvalidResponse
        }
    }

    fn be(value: u16) -> [u8; 2] {
        value.to_be_bytes()
    }

    fn word(bytes: &[u8], at: usize) -> u16 {
        u16::from_be_bytes([bytes[at], bytes[at + 1]])
    }
}

impl Protocol for ModbusRtu {
    fn checksum(&self) -> Checksum {
        CHECKSUM
    }

    fn is_frame_start(&self, byte: u8, unit: u8) -> bool {
        byte == unit
    }

    fn encode_request(&self, unit: u8, request: &Request) -> Result<FrameBuf> {
        Self::client(unit, request).map(|(_, buff)| buff)
    }

    fn decode_response(&self, buf: &[u8]) -> core::result::Result<Decoded, FrameError> {
        // Unit, function, then a byte count or an exception code.
        if buf.len() < 3 {
            return Ok(Decoded::Incomplete);
        }
        let function = buf[1];
        Function::try_from(function & !Function::EXCEPTION_FLAG)
            .map_err(|_| FrameError::Function(function))?;
        if function == u8::from(Function::ReadHolding) {
            let count = buf[2] as usize;
            if count == 0 || count % 2 != 0 || count > 2 * MAX_READ_REGISTERS as usize {
                return Err(FrameError::Length(count));
            }
        }
        let len = rmodbus::guess_response_frame_len(buf, ModbusProto::Rtu)
            .map_err(|_| FrameError::Function(function))?;
        Self::checked_frame(buf, len.into())
    }

    fn parse_response(&self, request: &Request, frame: &Frame) -> Result<Response> {
        let expected = Self::function_for(request);
        if frame.function & !Function::EXCEPTION_FLAG != u8::from(expected) {
            return Err(Error::InvalidResponse);
        }
        let (req, _) = Self::client(frame.unit, request)?;
        let buff = Self::wire(frame)?;
        let rejected = |err: rmodbus::ErrorKind| Self::rejected(expected, frame, err);
        if frame.is_exception() {
            return Err(match req.parse_ok(&buff) {
                Err(err) => rejected(err),
                Ok(()) => Error::InvalidResponse,
            });
        }

        let payload = frame.payload.as_slice();
        match request {
            Request::Read { start, count } => {
                if payload.first().map(|n| *n as usize) != Some(*count as usize * 2) {
                    return Err(Error::InvalidResponse);
                }
                let mut values = Values::new();
                req.parse_u16(&buff, &mut values).map_err(rejected)?;
                if values.len() != *count as usize {
                    return Err(Error::InvalidResponse);
                }
                Ok(Response::Registers {
                    start: *start,
                    values,
                })
            }
            Request::Write { start, values } => {
                req.parse_ok(&buff).map_err(rejected)?;
                let echoed = if values.len() == 1 {
                    values[0]
                } else {
                    values.len() as u16
                };
                if payload.len() != 4
                    || Self::word(payload, 0) != *start
                    || Self::word(payload, 2) != echoed
                {
                    return Err(Error::InvalidResponse);
                }
                Ok(Response::Written {
                    start: *start,
                    count: values.len() as u16,
                })
            }
        }
    }

    fn decode_request(
        &self,
        buf: &[u8],
    ) -> core::result::Result<Decoded<RequestFrame>, FrameError> {
        if buf.len() < 2 {
            return Ok(Decoded::Incomplete);
        }
        let function = Function::try_from(buf[1])?;
        let len = match function {
            Function::ReadHolding | Function::WriteSingle => FIXED_FRAME_LEN,
            Function::WriteMultiple => {
                let Some(&count) = buf.get(6) else {
                    return Ok(Decoded::Incomplete);
                };
                let count = count as usize;
                if count == 0 || count % 2 != 0 || count > 2 * MAX_WRITE_REGISTERS {
                    return Err(FrameError::Length(count));
                }
                7 + count + CRC_LEN
            }
        };

        let (frame, consumed) = match Self::checked_frame(buf, len)? {
            Decoded::Complete { frame, consumed } => (frame, consumed),
            Decoded::Incomplete => return Ok(Decoded::Incomplete),
        };
        let payload = frame.payload.as_slice();
        let start = Self::word(payload, 0);
        let request = match function {
            Function::ReadHolding => Request::read(start, Self::word(payload, 2)),
            Function::WriteSingle => Request::write(start, &[Self::word(payload, 2)]),
            Function::WriteMultiple => {
                let quantity = Self::word(payload, 2) as usize;
                let values = registers_from_bytes(&payload[5..])
                    .filter(|values| values.len() == quantity)
                    .ok_or(FrameError::Length(quantity))?;
                Request::write(start, &values)
            }
        }
        .map_err(|_| FrameError::Length(len))?;

        Ok(Decoded::Complete {
            frame: RequestFrame {
                unit: frame.unit,
                request,
            },
            consumed,
        })
    }

    fn encode_response(
        &self,
        unit: u8,
        request: &Request,
        response: &Response,
    ) -> Result<FrameBuf> {
        let function = Self::function_for(request);
        let mut frame = FrameBuf::new();
        push_bytes(&mut frame, &[unit, function.into()])?;
        match (response, request) {
            (Response::Registers { values, .. }, _) => {
                push_bytes(&mut frame, &[(values.len() * 2) as u8])?;
                for value in values {
                    push_bytes(&mut frame, &Self::be(*value))?;
                }
            }
            (Response::Written { start, .. }, Request::Write { values, .. })
                if values.len() == 1 =>
            {
                push_bytes(&mut frame, &Self::be(*start))?;
                push_bytes(&mut frame, &Self::be(values[0]))?;
            }
            (Response::Written { start, count }, _) => {
                push_bytes(&mut frame, &Self::be(*start))?;
                push_bytes(&mut frame, &Self::be(*count))?;
            }
        }
        CHECKSUM.append(&mut frame)?;
        Ok(frame)
    }

    fn encode_exception(&self, unit: u8, request: &Request, code: u8) -> Result<FrameBuf> {
        let function = u8::from(Self::function_for(request)) | Function::EXCEPTION_FLAG;
        let mut frame = FrameBuf::new();
        push_bytes(&mut frame, &[unit, function, code])?;
        CHECKSUM.append(&mut frame)?;
        Ok(frame)
    }
}
