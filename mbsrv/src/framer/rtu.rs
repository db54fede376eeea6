//! RTU framing: `device id | function code | body | crc16 (LE)`.
//!
//! On a real serial line frames are delimited by 3.5-character silent gaps.
//! Reassembling from a byte stream instead, the body length is derived from
//! the expected-length tables (or a byte-count field inside the body), and
//! the CRC decides whether the guessed boundary was real. On a CRC mismatch
//! the framer steps forward one byte and rescans, which also realigns after
//! line noise. The same framer handles RTU-over-TCP, where TCP fragmentation
//! can split frames at any point.

use log::{debug, warn};
use std::sync::Arc;

use mbsrv_protocol::checksum::{check_crc16, crc16};
use mbsrv_protocol::Result;

use super::{decode_pdu, pdu_len, Adu, DecodedFrame, DeviceFilter, Direction, FrameEvent, Framer};
use crate::registry::FunctionRegistry;

/// device id + PDU + CRC. Anything longer pending without a boundary is
/// treated as garbage.
const MAX_FRAME_LEN: usize = 256;
const MIN_FRAME_LEN: usize = 4;

pub struct RtuFramer {
    direction: Direction,
    registry: Option<Arc<FunctionRegistry>>,
    buf: Vec<u8>,
    dropped: u64,
}

impl RtuFramer {
    pub fn new(direction: Direction, registry: Option<Arc<FunctionRegistry>>) -> Self {
        Self {
            direction,
            registry,
            buf: Vec::new(),
            dropped: 0,
        }
    }

    /// Drop the first buffered byte and rescan from the next one.
    fn step(&mut self) {
        self.buf.drain(..1);
    }
}

impl Framer for RtuFramer {
    fn build(&mut self, adu: &Adu) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(3 + adu.pdu.len());
        out.push(adu.device_id);
        out.extend(&adu.pdu);
        out.extend(&crc16(&out).to_le_bytes());
        Ok(out)
    }

    fn consume(&mut self, bytes: &[u8], filter: &DeviceFilter, sink: &mut dyn FnMut(FrameEvent)) {
        self.buf.extend(bytes);
        loop {
            if self.buf.len() < MIN_FRAME_LEN {
                return;
            }
            let total = match pdu_len(self.direction, &self.buf[1..], self.registry.as_deref()) {
                Ok(Some(pdu_len)) => 1 + pdu_len + 2,
                Ok(None) => {
                    if self.buf.len() > MAX_FRAME_LEN {
                        warn!("overlong pending RTU frame, resynchronizing");
                        self.dropped += 1;
                        self.step();
                        continue;
                    }
                    return;
                }
                Err(error) => {
                    debug!("unparseable RTU frame start: {}", error);
                    self.dropped += 1;
                    self.step();
                    continue;
                }
            };
            if total > MAX_FRAME_LEN {
                debug!("dropping impossible RTU frame length {}", total);
                self.dropped += 1;
                self.step();
                continue;
            }
            if self.buf.len() < total {
                return;
            }
            if !check_crc16(&self.buf[..total]) {
                debug!("RTU CRC mismatch, stepping one byte");
                self.dropped += 1;
                self.step();
                continue;
            }
            let device_id = self.buf[0];
            if !filter.accepts(device_id) {
                debug!("ignoring frame for device {}", device_id);
                self.buf.drain(..total);
                continue;
            }
            let function_code = self.buf[1];
            match decode_pdu(
                self.direction,
                &self.buf[1..total - 2],
                self.registry.as_deref(),
            ) {
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::framer::Pdu;
    use mbsrv_protocol::{ExceptionCode, Request, Response};

    fn collect(framer: &mut RtuFramer, bytes: &[u8], filter: &DeviceFilter) -> Vec<DecodedFrame> {
        let mut out = Vec::new();
        framer.consume(bytes, filter, &mut |event| {
            if let FrameEvent::Frame(frame) = event {
                out.push(frame);
            }
        });
        out
    }

    #[test]
    fn test_build_read_holding_request() {
        let mut framer = RtuFramer::new(Direction::Response, None);
        let pdu = Request::ReadHoldingRegisters { addr: 1, cnt: 10 }
            .encode()
            .unwrap();
        let adu = Adu {
            transaction_id: 0,
            device_id: 1,
            pdu,
        };
        assert_eq!(
            framer.build(&adu).unwrap(),
            vec![0x01, 0x03, 0x00, 0x01, 0x00, 0x0A, 0xD5, 0xC9]
        );
    }

    #[test]
    fn test_exception_response() {
        let mut framer = RtuFramer::new(Direction::Response, None);
        let frames = collect(
            &mut framer,
            &[0x11, 0x83, 0x02, 0xC0, 0xF1],
            &DeviceFilter::any(),
        );
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].device_id, 17);
        assert_eq!(
            frames[0].pdu,
            Pdu::Response(Response::Exception {
                function_code: 3,
                code: ExceptionCode::IllegalDataAddress
            })
        );
    }

    #[test]
    fn test_garbled_prefix_resync() {
        let bytes = [
            0xAB, 0xCD, 0x11, 0x03, 0x06, 0xAE, 0x41, 0x56, 0x52, 0x43, 0x40, 0x49, 0xAD,
        ];
        let mut framer = RtuFramer::new(Direction::Response, None);
        let frames = collect(&mut framer, &bytes, &DeviceFilter::any());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].device_id, 17);
        assert_eq!(
            frames[0].pdu,
            Pdu::Response(Response::ReadHoldingRegisters {
                words: vec![0xAE41, 0x5652, 0x4340]
            })
        );
        assert!(framer.dropped_frames() >= 1);
    }

    #[test]
    fn test_fragmentation_boundaries() {
        let frame = [
            0x11, 0x03, 0x06, 0xAE, 0x41, 0x56, 0x52, 0x43, 0x40, 0x49, 0xAD,
        ];
        for cut in 1..frame.len() {
            let mut framer = RtuFramer::new(Direction::Response, None);
            let filter = DeviceFilter::any();
            let mut frames = collect(&mut framer, &frame[..cut], &filter);
            frames.extend(collect(&mut framer, &frame[cut..], &filter));
            assert_eq!(frames.len(), 1, "split at {}", cut);
        }
    }

    #[test]
    fn test_request_direction_uses_request_table() {
        // fc 3 request is five PDU bytes, not byte-count delimited
        let mut framer = RtuFramer::new(Direction::Request, None);
        let frames = collect(
            &mut framer,
            &[0x01, 0x03, 0x00, 0x01, 0x00, 0x0A, 0xD5, 0xC9],
            &DeviceFilter::any(),
        );
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].pdu,
            Pdu::Request(Request::ReadHoldingRegisters { addr: 1, cnt: 10 })
        );
    }

    #[test]
    fn test_crc_corruption_drops_frame() {
        let mut frame = vec![0x01, 0x03, 0x00, 0x01, 0x00, 0x0A, 0xD5, 0xC9];
        frame[2] = 0x01;
        let mut framer = RtuFramer::new(Direction::Request, None);
        let frames = collect(&mut framer, &frame, &DeviceFilter::any());
        assert!(frames.is_empty());
        assert!(framer.dropped_frames() >= 1);
    }

    #[test]
    fn test_device_filter_silently_drops() {
        let mut framer = RtuFramer::new(Direction::Request, None);
        let pdu = Request::ReadCoils { addr: 0, cnt: 1 }.encode().unwrap();
        let bytes = framer
            .build(&Adu {
                transaction_id: 0,
                device_id: 9,
                pdu,
            })
            .unwrap();
        let frames = collect(&mut framer, &bytes, &DeviceFilter::only(vec![1]));
        assert!(frames.is_empty());
        assert_eq!(framer.dropped_frames(), 0);
    }

    #[test]
    fn test_random_fragmentation() {
        use rand::Rng;
        let mut stream = Vec::new();
        let mut builder = RtuFramer::new(Direction::Response, None);
        for device_id in 1..=5_u8 {
            let pdu = Response::ReadHoldingRegisters {
                words: vec![device_id as u16; device_id as usize],
            }
            .encode()
            .unwrap();
            stream.extend(
                builder
                    .build(&Adu {
                        transaction_id: 0,
                        device_id,
                        pdu,
                    })
                    .unwrap(),
            );
        }
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut framer = RtuFramer::new(Direction::Response, None);
            let filter = DeviceFilter::any();
            let mut frames = Vec::new();
            let mut pos = 0;
            while pos < stream.len() {
                let end = (pos + rng.gen_range(1..=7)).min(stream.len());
                frames.extend(collect(&mut framer, &stream[pos..end], &filter));
                pos = end;
            }
            assert_eq!(frames.len(), 5);
            assert_eq!(framer.dropped_frames(), 0);
        }
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut framer = RtuFramer::new(Direction::Response, None);
        let mut bytes = Vec::new();
        for _ in 0..2 {
            bytes.extend(&[0x11, 0x83, 0x02, 0xC0, 0xF1]);
        }
        let frames = collect(&mut framer, &bytes, &DeviceFilter::any());
        assert_eq!(frames.len(), 2);
    }
}
