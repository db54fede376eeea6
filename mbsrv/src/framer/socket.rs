//! Modbus/TCP framing with the 7-byte MBAP envelope.
//!
//! Header layout, all big-endian: transaction id (u16), protocol id (u16,
//! always 0), length (u16, covers unit id + PDU), unit id (u8). TCP provides
//! integrity, so there is no checksum.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};
use std::sync::Arc;

use mbsrv_protocol::{Result, MAX_PDU_SIZE};

use super::{decode_pdu, Adu, DecodedFrame, DeviceFilter, Direction, FrameEvent, Framer};
use crate::registry::FunctionRegistry;

const MBAP_HEADER_LEN: usize = 7;

pub struct SocketFramer {
    direction: Direction,
    registry: Option<Arc<FunctionRegistry>>,
    buf: Vec<u8>,
    dropped: u64,
}

impl SocketFramer {
    pub fn new(direction: Direction, registry: Option<Arc<FunctionRegistry>>) -> Self {
        Self {
            direction,
            registry,
            buf: Vec::new(),
            dropped: 0,
        }
    }
}

impl Framer for SocketFramer {
    fn build(&mut self, adu: &Adu) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(MBAP_HEADER_LEN + adu.pdu.len());
        out.extend(&adu.transaction_id.to_be_bytes());
        out.extend(&[0_u8, 0]);
        out.extend(&(adu.pdu.len() as u16 + 1).to_be_bytes());
        out.push(adu.device_id);
        out.extend(&adu.pdu);
        Ok(out)
    }

    fn consume(&mut self, bytes: &[u8], filter: &DeviceFilter, sink: &mut dyn FnMut(FrameEvent)) {
        self.buf.extend(bytes);
        loop {
            if self.buf.len() < MBAP_HEADER_LEN + 1 {
                return;
            }
            let transaction_id = BigEndian::read_u16(&self.buf[0..2]);
            let protocol_id = BigEndian::read_u16(&self.buf[2..4]);
            let length = BigEndian::read_u16(&self.buf[4..6]) as usize;
            let device_id = self.buf[6];
            if protocol_id != 0 {
                warn!(
                    "dropping MBAP frame with protocol id 0x{:04X}",
                    protocol_id
                );
                self.dropped += 1;
                self.buf.drain(..MBAP_HEADER_LEN);
                continue;
            }
            if length < 2 || length > MAX_PDU_SIZE + 1 {
                warn!("dropping impossible MBAP length {}", length);
                self.dropped += 1;
                self.buf.drain(..1);
                continue;
            }
            let total = 6 + length;
            if self.buf.len() < total {
                return;
            }
            if !filter.accepts(device_id) {
                debug!("ignoring frame for device {}", device_id);
                self.buf.drain(..total);
                continue;
            }
            let function_code = self.buf[7];
            match decode_pdu(self.direction, &self.buf[7..total], self.registry.as_deref()) {
                Ok(pdu) => sink(FrameEvent::Frame(DecodedFrame {
                    device_id,
                    transaction_id,
                    pdu,
                })),
                Err(error) => {
                    debug!("failed to decode PDU from device {}: {}", device_id, error);
                    self.dropped += 1;
                    sink(FrameEvent::DecodeFailure {
                        device_id,
                        transaction_id,
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
