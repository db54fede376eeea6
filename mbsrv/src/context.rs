//! The datastore a server answers from.
//!
//! Four block kinds map onto two storage layouts: `Separate` keeps four
//! independent address spaces, `Shared` aliases all four onto one word array
//! (a bit read tests the addressed word, a bit write stores 0 or 1). Address
//! translation is pass-through by default; `one_based` subtracts one from
//! every protocol address first.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use mbsrv_protocol::{function_codes as fc, DeviceInfoObject, Error, Result};

/// The event log keeps this many most-recent bytes, per the application
/// protocol's Get Comm Event Log limit.
const MAX_EVENT_LOG: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl BlockKind {
    /// The block a function code operates on.
    pub fn of_function_code(code: u8) -> Option<BlockKind> {
        match code {
            fc::READ_COILS | fc::WRITE_SINGLE_COIL | fc::WRITE_MULTIPLE_COILS => {
                Some(BlockKind::Coil)
            }
            fc::READ_DISCRETE_INPUTS => Some(BlockKind::DiscreteInput),
            fc::READ_HOLDING_REGISTERS
            | fc::WRITE_SINGLE_REGISTER
            | fc::WRITE_MULTIPLE_REGISTERS
            | fc::MASK_WRITE_REGISTER
            | fc::READ_WRITE_MULTIPLE_REGISTERS
            | fc::READ_FIFO_QUEUE => Some(BlockKind::HoldingRegister),
            fc::READ_INPUT_REGISTERS => Some(BlockKind::InputRegister),
            _ => None,
        }
    }

    pub fn is_bits(self) -> bool {
        matches!(self, BlockKind::Coil | BlockKind::DiscreteInput)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockLayout {
    Shared,
    Separate,
}

/// Build a context of the configured layout with uniformly sized blocks.
pub fn make_context(layout: BlockLayout, size: usize) -> Box<dyn DeviceContext> {
    match layout {
        BlockLayout::Separate => Box::new(SeparateBlocks::uniform(size)),
        BlockLayout::Shared => Box::new(SharedBlocks::new(size)),
    }
}

/// Abstract read/write/validate contract the server dispatch talks to.
/// Implementations own their storage; the engine accesses a context from a
/// single task only.
pub trait DeviceContext: Send {
    /// Whether the addressed range exists in the block.
    fn validate(&self, kind: BlockKind, addr: u16, cnt: u16) -> bool;

    /// Whether a bit write to the range preserves the declared width of the
    /// underlying storage. Layouts that alias bits onto words can refuse bit
    /// writes that would clobber a multi-bit value; consulted only by servers
    /// that enforce type exceptions.
    fn check_bit_write(&self, _kind: BlockKind, _addr: u16, _cnt: u16) -> bool {
        true
    }

    fn get_bits(&self, kind: BlockKind, addr: u16, cnt: u16) -> Result<Vec<bool>>;
    fn set_bits(&mut self, kind: BlockKind, addr: u16, values: &[bool]) -> Result<()>;
    fn get_words(&self, kind: BlockKind, addr: u16, cnt: u16) -> Result<Vec<u16>>;
    fn set_words(&mut self, kind: BlockKind, addr: u16, values: &[u16]) -> Result<()>;
}

fn range(one_based: bool, len: usize, addr: u16, cnt: usize) -> Result<std::ops::Range<usize>> {
    let start = if one_based {
        match addr.checked_sub(1) {
            Some(x) => x as usize,
            None => {
                return Err(Error::invalid_request(anyhow!(
                    "address 0 is invalid in one-based mode"
                )))
            }
        }
    } else {
        addr as usize
    };
    let end = start + cnt;
    if end > len {
        return Err(Error::invalid_request(anyhow!(
            "range {}..{} outside block of {} entries",
            start,
            end,
            len
        )));
    }
    Ok(start..end)
}

/// Four independent address spaces. The default layout.
pub struct SeparateBlocks {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding_registers: Vec<u16>,
    input_registers: Vec<u16>,
    one_based: bool,
}

impl SeparateBlocks {
    pub fn new(coils: usize, discrete_inputs: usize, holding: usize, input: usize) -> Self {
        Self {
            coils: vec![false; coils],
            discrete_inputs: vec![false; discrete_inputs],
            holding_registers: vec![0; holding],
            input_registers: vec![0; input],
            one_based: false,
        }
    }

    /// All four blocks sized identically.
    pub fn uniform(size: usize) -> Self {
        Self::new(size, size, size, size)
    }

    pub fn one_based(mut self) -> Self {
        self.one_based = true;
        self
    }

    fn bits(&self, kind: BlockKind) -> &[bool] {
        match kind {
            BlockKind::Coil => &self.coils,
            _ => &self.discrete_inputs,
        }
    }

    fn words(&self, kind: BlockKind) -> &[u16] {
        match kind {
            BlockKind::HoldingRegister => &self.holding_registers,
            _ => &self.input_registers,
        }
    }

    fn len(&self, kind: BlockKind) -> usize {
        match kind {
            BlockKind::Coil => self.coils.len(),
            BlockKind::DiscreteInput => self.discrete_inputs.len(),
            BlockKind::HoldingRegister => self.holding_registers.len(),
            BlockKind::InputRegister => self.input_registers.len(),
        }
    }
}

impl DeviceContext for SeparateBlocks {
    fn validate(&self, kind: BlockKind, addr: u16, cnt: u16) -> bool {
        range(self.one_based, self.len(kind), addr, cnt as usize).is_ok()
    }

    fn get_bits(&self, kind: BlockKind, addr: u16, cnt: u16) -> Result<Vec<bool>> {
        if !kind.is_bits() {
            return Err(Error::internal(anyhow!("bit access to a register block")));
        }
        let range = range(self.one_based, self.len(kind), addr, cnt as usize)?;
        Ok(self.bits(kind)[range].to_vec())
    }

    fn set_bits(&mut self, kind: BlockKind, addr: u16, values: &[bool]) -> Result<()> {
        if kind != BlockKind::Coil {
            return Err(Error::internal(anyhow!("writes only reach coils")));
        }
        let range = range(self.one_based, self.coils.len(), addr, values.len())?;
        self.coils[range].copy_from_slice(values);
        Ok(())
    }

    fn get_words(&self, kind: BlockKind, addr: u16, cnt: u16) -> Result<Vec<u16>> {
        if kind.is_bits() {
            return Err(Error::internal(anyhow!("word access to a bit block")));
        }
        let range = range(self.one_based, self.len(kind), addr, cnt as usize)?;
        Ok(self.words(kind)[range].to_vec())
    }

    fn set_words(&mut self, kind: BlockKind, addr: u16, values: &[u16]) -> Result<()> {
        if kind != BlockKind::HoldingRegister {
            return Err(Error::internal(anyhow!("writes only reach holding registers")));
        }
        let range = range(self.one_based, self.holding_registers.len(), addr, values.len())?;
        self.holding_registers[range].copy_from_slice(values);
        Ok(())
    }
}

/// One word array aliased by all four block kinds.
pub struct SharedBlocks {
    words: Vec<u16>,
    one_based: bool,
}

impl SharedBlocks {
    pub fn new(size: usize) -> Self {
        Self {
            words: vec![0; size],
            one_based: false,
        }
    }

    pub fn one_based(mut self) -> Self {
        self.one_based = true;
        self
    }

    pub fn word(&self, addr: usize) -> u16 {
        self.words[addr]
    }
}

impl DeviceContext for SharedBlocks {
    fn validate(&self, _kind: BlockKind, addr: u16, cnt: u16) -> bool {
        range(self.one_based, self.words.len(), addr, cnt as usize).is_ok()
    }

    fn check_bit_write(&self, _kind: BlockKind, addr: u16, cnt: u16) -> bool {
        match range(self.one_based, self.words.len(), addr, cnt as usize) {
            Ok(range) => self.words[range].iter().all(|x| *x <= 1),
            Err(_) => false,
        }
    }

    fn get_bits(&self, _kind: BlockKind, addr: u16, cnt: u16) -> Result<Vec<bool>> {
        let range = range(self.one_based, self.words.len(), addr, cnt as usize)?;
        Ok(self.words[range].iter().map(|x| *x != 0).collect())
    }

    fn set_bits(&mut self, _kind: BlockKind, addr: u16, values: &[bool]) -> Result<()> {
        let range = range(self.one_based, self.words.len(), addr, values.len())?;
        for (slot, value) in self.words[range].iter_mut().zip(values) {
            *slot = u16::from(*value);
        }
        Ok(())
    }

    fn get_words(&self, _kind: BlockKind, addr: u16, cnt: u16) -> Result<Vec<u16>> {
        let range = range(self.one_based, self.words.len(), addr, cnt as usize)?;
        Ok(self.words[range].to_vec())
    }

    fn set_words(&mut self, _kind: BlockKind, addr: u16, values: &[u16]) -> Result<()> {
        let range = range(self.one_based, self.words.len(), addr, values.len())?;
        self.words[range].copy_from_slice(values);
        Ok(())
    }
}

/// Per-device communication counters and the comm event log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommCounters {
    pub bus_message: u16,
    pub bus_comm_error: u16,
    pub bus_exception_error: u16,
    pub server_message: u16,
    pub server_no_response: u16,
    pub event_count: u16,
    pub diagnostic_register: u16,
    event_log: VecDeque<u8>,
}

impl CommCounters {
    pub fn record_bus_message(&mut self) {
        self.bus_message = self.bus_message.wrapping_add(1);
        self.server_message = self.server_message.wrapping_add(1);
    }

    pub fn record_comm_error(&mut self) {
        self.bus_comm_error = self.bus_comm_error.wrapping_add(1);
    }

    pub fn record_exception(&mut self) {
        self.bus_exception_error = self.bus_exception_error.wrapping_add(1);
    }

    pub fn record_no_response(&mut self) {
        self.server_no_response = self.server_no_response.wrapping_add(1);
    }

    pub fn record_event(&mut self, event: u8) {
        self.event_count = self.event_count.wrapping_add(1);
        if self.event_log.len() == MAX_EVENT_LOG {
            self.event_log.pop_back();
        }
        self.event_log.push_front(event);
    }

    /// Events, most recent first.
    pub fn events(&self) -> Vec<u8> {
        self.event_log.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        *self = Default::default();
    }

    pub fn clear_event_log(&mut self) {
        self.event_log.clear();
    }
}

/// Identification strings served by Report Device Id and Read Device
/// Information.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_name: String,
    pub product_code: String,
    pub revision: String,
    pub vendor_url: Option<String>,
    pub product_name: Option<String>,
    pub model_name: Option<String>,
    pub user_application_name: Option<String>,
}

impl DeviceIdentity {
    pub fn new(vendor_name: &str, product_code: &str, revision: &str) -> Self {
        Self {
            vendor_name: vendor_name.into(),
            product_code: product_code.into(),
            revision: revision.into(),
            ..Default::default()
        }
    }

    fn object_value(&self, id: u8) -> Option<&str> {
        use mbsrv_protocol::device_info_objects as obj;
        match id {
            obj::VENDOR_NAME => Some(&self.vendor_name),
            obj::PRODUCT_CODE => Some(&self.product_code),
            obj::REVISION => Some(&self.revision),
            obj::VENDOR_URL => self.vendor_url.as_deref(),
            obj::PRODUCT_NAME => self.product_name.as_deref(),
            obj::MODEL_NAME => self.model_name.as_deref(),
            obj::USER_APPLICATION_NAME => self.user_application_name.as_deref(),
            _ => None,
        }
    }

    /// Objects in the id range of `read_code`, starting at `start`, in object
    /// id order.
    pub fn objects(&self, read_code: u8, start: u8) -> Vec<DeviceInfoObject> {
        let last = match read_code {
            1 => 0x02,
            2 => 0x06,
            _ => 0x06,
        };
        (start..=last)
            .filter_map(|id| {
                self.object_value(id).map(|value| DeviceInfoObject {
                    id,
                    value: value.as_bytes().to_vec(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_separate_blocks_round_trip() {
        let mut ctx = SeparateBlocks::uniform(100);
        ctx.set_bits(BlockKind::Coil, 10, &[true, false, true]).unwrap();
        assert_eq!(
            ctx.get_bits(BlockKind::Coil, 10, 3).unwrap(),
            vec![true, false, true]
        );
        // discrete inputs are independent of coils
        assert_eq!(
            ctx.get_bits(BlockKind::DiscreteInput, 10, 3).unwrap(),
            vec![false; 3]
        );
        ctx.set_words(BlockKind::HoldingRegister, 5, &[17, 18]).unwrap();
        assert_eq!(
            ctx.get_words(BlockKind::HoldingRegister, 5, 2).unwrap(),
            vec![17, 18]
        );
        assert_eq!(
            ctx.get_words(BlockKind::InputRegister, 5, 2).unwrap(),
            vec![0, 0]
        );
    }

    #[test]
    fn test_validate_bounds() {
        let ctx = SeparateBlocks::new(10, 0, 20, 0);
        assert!(ctx.validate(BlockKind::Coil, 0, 10));
        assert!(!ctx.validate(BlockKind::Coil, 1, 10));
        assert!(!ctx.validate(BlockKind::DiscreteInput, 0, 1));
        assert!(ctx.validate(BlockKind::HoldingRegister, 19, 1));
        assert!(!ctx.validate(BlockKind::HoldingRegister, 19, 2));
    }

    #[test]
    fn test_one_based_translation() {
        let mut ctx = SeparateBlocks::uniform(10).one_based();
        assert!(!ctx.validate(BlockKind::Coil, 0, 1));
        assert!(ctx.validate(BlockKind::Coil, 1, 10));
        assert!(!ctx.validate(BlockKind::Coil, 2, 10));
        ctx.set_words(BlockKind::HoldingRegister, 1, &[42]).unwrap();
        assert_eq!(ctx.get_words(BlockKind::HoldingRegister, 1, 1).unwrap(), vec![42]);
    }

    #[test]
    fn test_make_context_layouts() {
        let mut separate = make_context(BlockLayout::Separate, 8);
        separate.set_words(BlockKind::HoldingRegister, 0, &[5]).unwrap();
        assert_eq!(separate.get_bits(BlockKind::Coil, 0, 1).unwrap(), vec![false]);
        let mut shared = make_context(BlockLayout::Shared, 8);
        shared.set_words(BlockKind::HoldingRegister, 0, &[5]).unwrap();
        assert_eq!(shared.get_bits(BlockKind::Coil, 0, 1).unwrap(), vec![true]);
    }

    #[test]
    fn test_shared_blocks_alias() {
        let mut ctx = SharedBlocks::new(16);
        ctx.set_words(BlockKind::HoldingRegister, 3, &[2]).unwrap();
        // a nonzero word reads back as a set bit in every bit table
        assert_eq!(ctx.get_bits(BlockKind::Coil, 3, 1).unwrap(), vec![true]);
        assert_eq!(
            ctx.get_bits(BlockKind::DiscreteInput, 3, 1).unwrap(),
            vec![true]
        );
        ctx.set_bits(BlockKind::Coil, 3, &[false]).unwrap();
        assert_eq!(ctx.get_words(BlockKind::InputRegister, 3, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_comm_counters_event_log_capped() {
        let mut counters = CommCounters::default();
        for x in 0..70_u16 {
            counters.record_event(x as u8);
        }
        let events = counters.events();
        assert_eq!(events.len(), 64);
        assert_eq!(events[0], 69);
        assert_eq!(counters.event_count, 70);
        counters.clear();
        assert_eq!(counters.event_count, 0);
        assert!(counters.events().is_empty());
    }

    #[test]
    fn test_identity_objects() {
        let mut identity = DeviceIdentity::new("vendor", "product", "1.0");
        identity.model_name = Some("model".into());
        let basic = identity.objects(1, 0);
        assert_eq!(basic.len(), 3);
        assert_eq!(basic[0].value, b"vendor".to_vec());
        let regular = identity.objects(2, 0);
        // three mandatory objects plus the model name
        assert_eq!(regular.len(), 4);
        let from_model = identity.objects(2, 5);
        assert_eq!(from_model.len(), 1);
        assert_eq!(from_model[0].id, 5);
    }
}
