//! ASCII framing: `':' hex(device id) hex(fc) hex(body) hex(lrc) CRLF`.
//!
//! Every payload byte travels as two uppercase hex characters and the frame
//! is closed by the LRC byte. Bytes in front of a `:` are line noise and are
//! discarded; a `:` inside a pending frame restarts reception, per the
//! serial-line specification.

use log::{debug, warn};
use std::sync::Arc;

use mbsrv_protocol::checksum::{check_lrc, lrc};
use mbsrv_protocol::{Result, MAX_PDU_SIZE};

use super::{decode_pdu, Adu, DecodedFrame, DeviceFilter, Direction, FrameEvent, Framer};
use crate::registry::FunctionRegistry;

const FRAME_START: u8 = b':';
const FRAME_END: &[u8] = b"\r\n";

/// `:` + 2 hex chars per byte of (device id + PDU + LRC) + CRLF.
const MAX_FRAME_LEN: usize = 1 + 2 * (1 + MAX_PDU_SIZE + 1) + 2;

pub struct AsciiFramer {
    direction: Direction,
    registry: Option<Arc<FunctionRegistry>>,
    buf: Vec<u8>,
    dropped: u64,
}

impl AsciiFramer {
    pub fn new(direction: Direction, registry: Option<Arc<FunctionRegistry>>) -> Self {
        Self {
            direction,
            registry,
            buf: Vec::new(),
            dropped: 0,
        }
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

fn decode_hex(chars: &[u8]) -> Option<Vec<u8>> {
    if chars.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(chars.len() / 2);
    for pair in chars.chunks(2) {
        out.push(hex_value(pair[0])? << 4 | hex_value(pair[1])?);
    }
    Some(out)
}

impl Framer for AsciiFramer {
    fn build(&mut self, adu: &Adu) -> Result<Vec<u8>> {
        let mut raw = Vec::with_capacity(1 + adu.pdu.len());
        raw.push(adu.device_id);
        raw.extend(&adu.pdu);
        raw.push(lrc(&raw[..]));
        let mut out = Vec::with_capacity(MAX_FRAME_LEN);
        out.push(FRAME_START);
        for x in &raw {
            out.extend(format!("{:02X}", x).as_bytes());
        }
        out.extend(FRAME_END);
        Ok(out)
    }

    fn consume(&mut self, bytes: &[u8], filter: &DeviceFilter, sink: &mut dyn FnMut(FrameEvent)) {
        self.buf.extend(bytes);
        loop {
            // everything before a start marker is noise
            match self.buf.iter().position(|x| *x == FRAME_START) {
                None => {
                    if !self.buf.is_empty() {
                        debug!("discarding {} bytes outside any frame", self.buf.len());
                        self.buf.clear();
                    }
                    return;
                }
                Some(0) => {}
                Some(start) => {
                    debug!("discarding {} bytes outside any frame", start);
                    self.buf.drain(..start);
                }
            }
            // a second start marker aborts the pending frame
            if let Some(restart) = self.buf[1..].iter().position(|x| *x == FRAME_START) {
                let crlf = self.buf[1..]
                    .windows(2)
                    .position(|w| w == FRAME_END)
                    .map(|x| x + 1);
                if crlf.map_or(true, |end| restart + 1 < end) {
                    warn!("frame restarted before terminator, dropping partial frame");
                    self.dropped += 1;
                    self.buf.drain(..restart + 1);
                    continue;
                }
            }
            let end = match self.buf.windows(2).position(|w| w == FRAME_END) {
                Some(end) => end,
                None => {
                    if self.buf.len() > MAX_FRAME_LEN {
                        warn!("overlong pending ASCII frame, resynchronizing");
                        self.dropped += 1;
                        self.buf.clear();
                    }
                    return;
                }
            };
            let total = end + 2;
            let raw = decode_hex(&self.buf[1..end]);
            let raw = match raw {
                Some(raw) if raw.len() >= 3 => raw,
                _ => {
                    warn!("dropping ASCII frame with invalid hex payload");
                    self.dropped += 1;
                    self.buf.drain(..total);
                    continue;
                }
            };
            let (body, checksum) = raw.split_at(raw.len() - 1);
            if !check_lrc(body, checksum[0]) {
                debug!("ASCII LRC mismatch, dropping frame");
                self.dropped += 1;
                self.buf.drain(..total);
                continue;
            }
            let device_id = body[0];
            if !filter.accepts(device_id) {
                debug!("ignoring frame for device {}", device_id);
                self.buf.drain(..total);
                continue;
            }
            let function_code = body[1];
            match decode_pdu(self.direction, &body[1..], self.registry.as_deref()) {
                Ok(pdu) => sink(FrameEvent::Frame(DecodedFrame {
                    device_id,
                    transaction_id: 0,
                    pdu,
                })),
                Err(error) => {
                    debug!("failed to decode PDU from device {}: {}", device_id, error);
                    self.dropped += 1;
                    sink(FrameEvent::DecodeFailure {
                        device_id,
                        transaction_id: 0,
                        function_code,
                        error,
                    });
                }
            }
            self.buf.drain(..total);
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
    }

    fn dropped_frames(&self) -> u64 {
        self.dropped
    }
}
