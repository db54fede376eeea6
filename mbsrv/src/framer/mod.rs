//! Byte-stream framing.
//!
//! A framer turns `(device id, PDU)` pairs into wire bytes and incrementally
//! reassembles frames from arbitrarily fragmented input. Corruption never
//! kills a framer: invalid checksums and impossible headers drop bytes until
//! the stream realigns on the next valid frame.

mod ascii;
mod rtu;
mod socket;

pub use ascii::AsciiFramer;
pub use rtu::RtuFramer;
pub use socket::SocketFramer;

use std::collections::HashSet;
use std::sync::Arc;

use mbsrv_protocol::{codec, Error, FramerKind, Request, Response, Result};

use crate::registry::FunctionRegistry;

/// Which PDUs a framer extracts from the stream: a server parses requests, a
/// client parses responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pdu {
    Request(Request),
    Response(Response),
}

impl Pdu {
    pub fn function_code(&self) -> u8 {
        match self {
            Pdu::Request(x) => x.function_code(),
            Pdu::Response(x) => x.function_code(),
        }
    }
}

/// A complete, integrity-checked frame. `transaction_id` is 0 on serial
/// framings, which have no transaction field.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub device_id: u8,
    pub transaction_id: u16,
    pub pdu: Pdu,
}

/// Everything a framer reports upward. A frame that passes the integrity
/// check but fails PDU decoding is surfaced so a client can fail the waiting
/// transaction and a server can answer with an Illegal Data Value exception.
#[derive(Debug, Clone)]
pub enum FrameEvent {
    Frame(DecodedFrame),
    DecodeFailure {
        device_id: u8,
        transaction_id: u16,
        function_code: u8,
        error: Error,
    },
}

/// An outgoing frame: an already-encoded PDU plus its envelope fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Adu {
    pub transaction_id: u16,
    pub device_id: u8,
    pub pdu: Vec<u8>,
}

/// The set of device ids a consumer is interested in. Broadcast (0) is always
/// accepted; a client restricts to the devices it queried, a server to the
/// devices it serves.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter(Option<HashSet<u8>>);

impl DeviceFilter {
    pub fn any() -> Self {
        DeviceFilter(None)
    }

    pub fn only<I: IntoIterator<Item = u8>>(ids: I) -> Self {
        DeviceFilter(Some(ids.into_iter().collect()))
    }

    pub fn accepts(&self, device_id: u8) -> bool {
        device_id == mbsrv_protocol::BROADCAST_DEVICE_ID
            || match &self.0 {
                None => true,
                Some(ids) => ids.contains(&device_id),
            }
    }
}

pub trait Framer: Send {
    /// Serialize one ADU for transmission.
    fn build(&mut self, adu: &Adu) -> Result<Vec<u8>>;

    /// Append `bytes` to the internal buffer and deliver every complete frame
    /// whose device id passes `filter` to `sink`. Invalid frames are dropped
    /// internally and counted; incomplete frames stay buffered.
    fn consume(&mut self, bytes: &[u8], filter: &DeviceFilter, sink: &mut dyn FnMut(FrameEvent));

    /// Clear the buffer and any parsed header state.
    fn reset(&mut self);

    /// Number of frames dropped due to checksum or structural failures.
    fn dropped_frames(&self) -> u64;
}

pub fn make_framer(
    kind: FramerKind,
    direction: Direction,
    registry: Option<Arc<FunctionRegistry>>,
) -> Box<dyn Framer> {
    match kind {
        FramerKind::Socket => Box::new(SocketFramer::new(direction, registry)),
        FramerKind::Rtu | FramerKind::RtuOverTcp => Box::new(RtuFramer::new(direction, registry)),
        FramerKind::Ascii => Box::new(AsciiFramer::new(direction, registry)),
    }
}

/// Expected total PDU length for the given direction, consulting the custom
/// registry before the built-in tables.
fn pdu_len(
    direction: Direction,
    data: &[u8],
    registry: Option<&FunctionRegistry>,
) -> Result<Option<usize>> {
    if data.is_empty() {
        return Ok(None);
    }
    if let Some(registry) = registry {
        if let Some(custom) = registry.get(data[0]) {
            if direction == Direction::Response
                && data[0] & mbsrv_protocol::function_codes::EXCEPTION_FLAG != 0
            {
                return Ok(Some(2));
            }
            return match direction {
                Direction::Request => custom.request_pdu_len(data),
                Direction::Response => custom.response_pdu_len(data),
            };
        }
    }
    match direction {
        Direction::Request => codec::request_pdu_len(data),
        Direction::Response => codec::response_pdu_len(data),
    }
}

fn decode_pdu(
    direction: Direction,
    data: &[u8],
    registry: Option<&FunctionRegistry>,
) -> Result<Pdu> {
    if let Some(registry) = registry {
        if !data.is_empty()
            && data[0] & mbsrv_protocol::function_codes::EXCEPTION_FLAG == 0
            && registry.contains(data[0])
        {
            let custom = match direction {
                Direction::Request => Pdu::Request(Request::Custom {
                    function_code: data[0],
                    data: data[1..].to_vec(),
                }),
                Direction::Response => Pdu::Response(Response::Custom {
                    function_code: data[0],
                    data: data[1..].to_vec(),
                }),
            };
            return Ok(custom);
        }
    }
    match direction {
        Direction::Request => Request::decode(data).map(Pdu::Request),
        Direction::Response => Response::decode(data).map(Pdu::Response),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_device_filter() {
        let filter = DeviceFilter::only(vec![1, 17]);
        assert!(filter.accepts(1));
        assert!(filter.accepts(17));
        assert!(!filter.accepts(2));
        // broadcast always passes
        assert!(filter.accepts(0));
        assert!(DeviceFilter::any().accepts(42));
    }

    #[test]
    fn test_custom_registry_consulted_for_length() {
        let mut registry = FunctionRegistry::new();
        registry
            .register(Arc::new(crate::registry::FixedLengthFunction::new(
                0x44, 5, 7,
            )))
            .unwrap();
        let len = pdu_len(Direction::Response, &[0x44, 0x00], Some(&registry)).unwrap();
        assert_eq!(len, Some(7));
        // exception responses to custom codes are still two bytes
        let len = pdu_len(Direction::Response, &[0xC4, 0x01], Some(&registry)).unwrap();
        assert_eq!(len, Some(2));
        let decoded = decode_pdu(Direction::Response, &[0xC4, 0x01], Some(&registry)).unwrap();
        match decoded {
            Pdu::Response(Response::Exception { function_code, .. }) => {
                assert_eq!(function_code, 0x44)
            }
            x => panic!("unexpected pdu: {:?}", x),
        }
    }
}
