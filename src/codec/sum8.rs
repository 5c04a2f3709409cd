//! A compact self-describing frame with an additive checksum.
//!
//! Both directions share one layout, so the length is always known after six
//! bytes:
//!
//! ```text
//! 0xA5 | unit | func | reg_hi reg_lo | len | data[len] | sum
//! ```
//!
//! `sum` is the wrapping 8-bit sum of every byte before it. A read request
//! carries the register count as its two data bytes; a read reply carries the
//! values. A write request carries the values and is echoed as the ack. An
//! exception reply sets bit 7 of `func` and carries the exception code as its
//! only data byte.

use super::{
    Checksum, Decoded, Frame, FrameBuf, FrameError, Function, MAX_READ_REGISTERS, Protocol,
    Request, RequestFrame, Response, push_bytes, registers_from_bytes,
};
use crate::error::{Error, Result};

pub const HEADER: u8 = 0xA5;
const CHECKSUM: Checksum = Checksum::Sum8;
const PREFIX_LEN: usize = 6;
const MAX_DATA_LEN: usize = 2 * MAX_READ_REGISTERS as usize;

/// Register protocol built on [`HEADER`]-anchored frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sum8Protocol;

impl Sum8Protocol {
    /// `(unit, func, reg, data)` of a frame at the start of `buf`.
    fn split(buf: &[u8]) -> core::result::Result<Decoded<(u8, u8, u16, &[u8])>, FrameError> {
        let Some(&header) = buf.first() else {
            return Ok(Decoded::Incomplete);
        };
        if header != HEADER {
            return Err(FrameError::Header(header));
        }
        if buf.len() < PREFIX_LEN {
            return Ok(Decoded::Incomplete);
        }
        let function = buf[2];
        let base = function & !Function::EXCEPTION_FLAG;
        if !matches!(
            Function::try_from(base),
            Ok(Function::ReadHolding | Function::WriteSingle)
        ) {
            return Err(FrameError::Function(function));
        }
        let len = buf[5] as usize;
        if len > MAX_DATA_LEN {
            return Err(FrameError::Length(len));
        }

        let total = PREFIX_LEN + len + CHECKSUM.len();
        if buf.len() < total {
            return Ok(Decoded::Incomplete);
        }
        let computed = CHECKSUM.compute(&buf[..total - 1]);
        let received = CHECKSUM.read(&buf[total - 1..]);
        if computed != received {
            return Err(FrameError::Checksum { computed, received });
        }

        Ok(Decoded::Complete {
            frame: (
                buf[1],
                function,
                u16::from_be_bytes([buf[3], buf[4]]),
                &buf[PREFIX_LEN..PREFIX_LEN + len],
            ),
            consumed: total,
        })
    }

    fn build(unit: u8, function: u8, register: u16, data: &[u8]) -> Result<FrameBuf> {
        if data.len() > MAX_DATA_LEN {
            return Err(Error::InvalidRange);
        }
        let mut frame = FrameBuf::new();
        push_bytes(&mut frame, &[HEADER, unit, function])?;
        push_bytes(&mut frame, &register.to_be_bytes())?;
        push_bytes(&mut frame, &[data.len() as u8])?;
        push_bytes(&mut frame, data)?;
        CHECKSUM.append(&mut frame)?;
        Ok(frame)
    }

    fn function_for(request: &Request) -> Function {
        match request {
            Request::Read { .. } => Function::ReadHolding,
            Request::Write { .. } => Function::WriteSingle,
        }
    }

    fn values_to_bytes(values: &[u16]) -> heapless::Vec<u8, MAX_DATA_LEN> {
        values.iter().flat_map(|value| value.to_be_bytes()).collect()
    }
}

impl Protocol for Sum8Protocol {
    fn checksum(&self) -> Checksum {
        CHECKSUM
    }

    fn is_frame_start(&self, byte: u8, _unit: u8) -> bool {
        byte == HEADER
    }

    fn encode_request(&self, unit: u8, request: &Request) -> Result<FrameBuf> {
        match request {
            Request::Read { start, count } => {
                Self::build(unit, Function::ReadHolding.into(), *start, &count.to_be_bytes())
            }
            Request::Write { start, values } => Self::build(
                unit,
                Function::WriteSingle.into(),
                *start,
                &Self::values_to_bytes(values),
            ),
        }
    }

    fn decode_response(&self, buf: &[u8]) -> core::result::Result<Decoded, FrameError> {
        Ok(match Self::split(buf)? {
            Decoded::Complete {
                frame: (unit, function, register, data),
                consumed,
            } => {
                let mut payload = FrameBuf::new();
                // Data is at most MAX_DATA_LEN, well inside a FrameBuf.
                let _ = payload.extend_from_slice(&register.to_be_bytes());
                let _ = payload.extend_from_slice(data);
                Decoded::Complete {
                    frame: Frame {
                        unit,
                        function,
                        payload,
                    },
                    consumed,
                }
            }
            Decoded::Incomplete => Decoded::Incomplete,
        })
    }

    fn parse_response(&self, request: &Request, frame: &Frame) -> Result<Response> {
        let expected = u8::from(Self::function_for(request));
        if frame.payload.len() < 2 {
            return Err(Error::InvalidResponse);
        }
        let register = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
        let data = &frame.payload[2..];

        if frame.is_exception() {
            if frame.function & !Function::EXCEPTION_FLAG != expected {
                return Err(Error::InvalidResponse);
            }
            return Err(Error::Exception {
                function: expected,
                code: data.first().copied().unwrap_or_default(),
            });
        }
        if frame.function != expected || register != request.start() {
            return Err(Error::InvalidResponse);
        }

        match request {
            Request::Read { start, count } => {
                if data.len() != *count as usize * 2 {
                    return Err(Error::InvalidResponse);
                }
                let values = registers_from_bytes(data).ok_or(Error::InvalidResponse)?;
                Ok(Response::Registers {
                    start: *start,
                    values,
                })
            }
            Request::Write { start, values } => {
                if data != Self::values_to_bytes(values).as_slice() {
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
        let (unit, function, register, data, consumed) = match Self::split(buf)? {
            Decoded::Complete {
                frame: (unit, function, register, data),
                consumed,
            } => (unit, function, register, data, consumed),
            Decoded::Incomplete => return Ok(Decoded::Incomplete),
        };
        let request = match Function::try_from(function)? {
            Function::ReadHolding if data.len() == 2 => {
                Request::read(register, u16::from_be_bytes([data[0], data[1]]))
            }
            Function::WriteSingle => {
                let values = registers_from_bytes(data).ok_or(FrameError::Length(data.len()))?;
                Request::write(register, &values)
            }
            _ => return Err(FrameError::Length(data.len())),
        }
        .map_err(|_| FrameError::Length(data.len()))?;

        Ok(Decoded::Complete {
            frame: RequestFrame { unit, request },
            consumed,
        })
    }

    fn encode_response(
        &self,
        unit: u8,
        request: &Request,
        response: &Response,
    ) -> Result<FrameBuf> {
        let function = Self::function_for(request).into();
        match (response, request) {
            (Response::Registers { start, values }, _) => {
                Self::build(unit, function, *start, &Self::values_to_bytes(values))
            }
            (Response::Written { start, .. }, Request::Write { values, .. }) => {
                Self::build(unit, function, *start, &Self::values_to_bytes(values))
            }
            (Response::Written { .. }, Request::Read { .. }) => Err(Error::InvalidResponse),
        }
    }

    fn encode_exception(&self, unit: u8, request: &Request, code: u8) -> Result<FrameBuf> {
        let function = u8::from(Self::function_for(request)) | Function::EXCEPTION_FLAG;
        Self::build(unit, function, request.start(), &[code])
    }
}
