//! Server-side request dispatch.
//!
//! [`ServerDispatcher`] resolves the addressed device, validates the request
//! against its context, executes it and builds the response PDU. Validation
//! failures become exception responses instead of killing the connection:
//! unsupported function 01, bad range 02, bad value 03, datastore failure 04.
//! Broadcast requests are executed on every device and answered by none.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use mbsrv_protocol::{
    diagnostic_codes as diag, ExceptionCode, Request, Response, Result, BROADCAST_DEVICE_ID,
    MAX_PDU_SIZE,
};

use crate::context::{BlockKind, CommCounters, DeviceContext, DeviceIdentity};
use crate::framer::{make_framer, Adu, DeviceFilter, Direction, FrameEvent, Pdu};
use crate::registry::FunctionRegistry;
use crate::transport::Transport;

const RECV_CHUNK: usize = 4096;

/// Comm event byte recorded for a processed request (receive event, bits per
/// the serial line spec).
const EVENT_RECEIVE: u8 = 0x80;
/// Comm event byte recorded when a response is suppressed in listen-only
/// mode.
const EVENT_ENTERED_LISTEN_ONLY: u8 = 0x04;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Reject bit writes that would clobber wider values in aliased block
    /// layouts with an Illegal Data Value exception.
    pub enforce_type_exceptions: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enforce_type_exceptions: false,
        }
    }
}

/// One served device: its datastore, identification, counters and mode bits.
pub struct Device {
    pub context: Box<dyn DeviceContext>,
    pub identity: DeviceIdentity,
    pub counters: CommCounters,
    files: HashMap<u16, Vec<u16>>,
    listen_only: bool,
    exception_status: u8,
}

impl Device {
    pub fn new(context: Box<dyn DeviceContext>) -> Self {
        Self {
            context,
            identity: DeviceIdentity::default(),
            counters: CommCounters::default(),
            files: HashMap::new(),
            listen_only: false,
            exception_status: 0,
        }
    }

    pub fn with_identity(mut self, identity: DeviceIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Install a record file served by the file record functions.
    pub fn insert_file(&mut self, file_number: u16, words: Vec<u16>) {
        self.files.insert(file_number, words);
    }

    pub fn set_exception_status(&mut self, status: u8) {
        self.exception_status = status;
    }

    pub fn is_listen_only(&self) -> bool {
        self.listen_only
    }
}

pub struct ServerDispatcher {
    devices: HashMap<u8, Device>,
    config: ServerConfig,
}

impl ServerDispatcher {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            devices: HashMap::new(),
            config,
        }
    }

    pub fn add_device(&mut self, device_id: u8, device: Device) -> Result<()> {
        if device_id == BROADCAST_DEVICE_ID {
            return Err(mbsrv_protocol::Error::invalid_request(anyhow::anyhow!(
                "device id 0 is reserved for broadcast"
            )));
        }
        self.devices.insert(device_id, device);
        Ok(())
    }

    pub fn device_ids(&self) -> Vec<u8> {
        self.devices.keys().copied().collect()
    }

    pub fn device_mut(&mut self, device_id: u8) -> Option<&mut Device> {
        self.devices.get_mut(&device_id)
    }

    /// Handle one decoded request. `None` means no response goes out:
    /// broadcast, listen-only mode, or a device this dispatcher does not
    /// serve.
    pub fn serve(&mut self, device_id: u8, request: &Request) -> Option<Response> {
        if device_id == BROADCAST_DEVICE_ID {
            for (id, device) in self.devices.iter_mut() {
                if request.is_read() {
                    continue;
                }
                device.counters.record_bus_message();
                device.counters.record_no_response();
                if let Err(code) = execute(device, *id, request, &self.config) {
                    debug!("broadcast request failed on device {}: {}", id, code);
                    device.counters.record_exception();
                }
            }
            return None;
        }
        let config = self.config.clone();
        let device = self.devices.get_mut(&device_id)?;
        device.counters.record_bus_message();
        let result = execute(device, device_id, request, &config);
        if device.listen_only {
            device.counters.record_no_response();
            device.counters.record_event(EVENT_ENTERED_LISTEN_ONLY);
            return None;
        }
        device.counters.record_event(EVENT_RECEIVE);
        let response = match result {
            Ok(response) => response,
            Err(code) => {
                warn!(
                    "request with function code {} failed on device {}: {}",
                    request.function_code(),
                    device_id,
                    code
                );
                device.counters.record_exception();
                Response::exception(request.function_code(), code)
            }
        };
        Some(response)
    }

    /// Handle a frame whose PDU failed to decode: the peer addressed us with
    /// a malformed value, which earns an Illegal Data Value exception.
    pub fn serve_decode_failure(&mut self, device_id: u8, function_code: u8) -> Option<Response> {
        if device_id == BROADCAST_DEVICE_ID {
            return None;
        }
        let device = self.devices.get_mut(&device_id)?;
        device.counters.record_bus_message();
        device.counters.record_comm_error();
        if device.listen_only {
            device.counters.record_no_response();
            return None;
        }
        device.counters.record_exception();
        Some(Response::exception(
            function_code,
            ExceptionCode::IllegalDataValue,
        ))
    }
}

fn execute(
    device: &mut Device,
    device_id: u8,
    request: &Request,
    config: &ServerConfig,
) -> std::result::Result<Response, ExceptionCode> {
    match request {
        Request::ReadCoils { addr, cnt } | Request::ReadDiscreteInputs { addr, cnt } => {
            let kind = if matches!(request, Request::ReadCoils { .. }) {
                BlockKind::Coil
            } else {
                BlockKind::DiscreteInput
            };
            if !device.context.validate(kind, *addr, *cnt) {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let bits = device
                .context
                .get_bits(kind, *addr, *cnt)
                .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
            Ok(if kind == BlockKind::Coil {
                Response::ReadCoils { bits }
            } else {
                Response::ReadDiscreteInputs { bits }
            })
        }
        Request::ReadHoldingRegisters { addr, cnt } | Request::ReadInputRegisters { addr, cnt } => {
            let kind = if matches!(request, Request::ReadHoldingRegisters { .. }) {
                BlockKind::HoldingRegister
            } else {
                BlockKind::InputRegister
            };
            if !device.context.validate(kind, *addr, *cnt) {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let words = device
                .context
                .get_words(kind, *addr, *cnt)
                .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
            Ok(if kind == BlockKind::HoldingRegister {
                Response::ReadHoldingRegisters { words }
            } else {
                Response::ReadInputRegisters { words }
            })
        }
        Request::WriteSingleCoil { addr, value } => {
            if !device.context.validate(BlockKind::Coil, *addr, 1) {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            if config.enforce_type_exceptions && !device.context.check_bit_write(BlockKind::Coil, *addr, 1) {
                return Err(ExceptionCode::IllegalDataValue);
            }
            device.context.set_bits(BlockKind::Coil, *addr, &[*value])
                .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
            Ok(Response::WriteSingleCoil {
                addr: *addr,
                value: *value,
            })
        }
        Request::WriteSingleRegister { addr, value } => {
            if !device.context.validate(BlockKind::HoldingRegister, *addr, 1) {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            device.context.set_words(BlockKind::HoldingRegister, *addr, &[*value])
                .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
            Ok(Response::WriteSingleRegister {
                addr: *addr,
                value: *value,
            })
        }
        Request::ReadExceptionStatus => Ok(Response::ReadExceptionStatus {
            status: device.exception_status,
        }),
        Request::Diagnostics { sub_function, data } => {
            let counters = &mut device.counters;
            let echo = |data: u16| Response::Diagnostics {
                sub_function: *sub_function,
                data,
            };
            match *sub_function {
                diag::RETURN_QUERY_DATA => Ok(echo(*data)),
                diag::RESTART_COMMUNICATIONS => {
                    device.listen_only = false;
                    if *data == 0xFF00 {
                        counters.clear_event_log();
                    }
                    Ok(echo(*data))
                }
                diag::RETURN_DIAGNOSTIC_REGISTER => Ok(echo(counters.diagnostic_register)),
                diag::FORCE_LISTEN_ONLY => {
                    device.listen_only = true;
                    Ok(echo(*data))
                }
                diag::CLEAR_COUNTERS => {
                    counters.clear();
                    Ok(echo(*data))
                }
                diag::RETURN_BUS_MESSAGE_COUNT => Ok(echo(counters.bus_message)),
                diag::RETURN_BUS_COMM_ERROR_COUNT => Ok(echo(counters.bus_comm_error)),
                diag::RETURN_BUS_EXCEPTION_COUNT => Ok(echo(counters.bus_exception_error)),
                diag::RETURN_SERVER_MESSAGE_COUNT => Ok(echo(counters.server_message)),
                diag::RETURN_SERVER_NO_RESPONSE_COUNT => Ok(echo(counters.server_no_response)),
                _ => Err(ExceptionCode::IllegalFunction),
            }
        }
        Request::GetCommEventCounter => Ok(Response::GetCommEventCounter {
            status: 0,
            event_count: device.counters.event_count,
        }),
        Request::GetCommEventLog => Ok(Response::GetCommEventLog {
            status: 0,
            event_count: device.counters.event_count,
            message_count: device.counters.bus_message,
            events: device.counters.events(),
        }),
        Request::WriteMultipleCoils { addr, values } => {
            if !device.context.validate(BlockKind::Coil, *addr, values.len() as u16) {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            if config.enforce_type_exceptions
                && !device.context.check_bit_write(BlockKind::Coil, *addr, values.len() as u16)
            {
                return Err(ExceptionCode::IllegalDataValue);
            }
            device.context.set_bits(BlockKind::Coil, *addr, values)
                .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
            Ok(Response::WriteMultipleCoils {
                addr: *addr,
                cnt: values.len() as u16,
            })
        }
        Request::WriteMultipleRegisters { addr, values } => {
            if !device.context.validate(BlockKind::HoldingRegister, *addr, values.len() as u16) {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            device.context.set_words(BlockKind::HoldingRegister, *addr, values)
                .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
            Ok(Response::WriteMultipleRegisters {
                addr: *addr,
                cnt: values.len() as u16,
            })
        }
        Request::ReportDeviceId => {
            let mut data = vec![device_id, 0xFF];
            data.extend(device.identity.product_code.as_bytes());
            Ok(Response::ReportDeviceId { data })
        }
        Request::ReadFileRecord { records } => {
            let mut out = Vec::with_capacity(records.len());
            for record in records {
                let file = device
                    .files
                    .get(&record.file_number)
                    .ok_or(ExceptionCode::IllegalDataAddress)?;
                let start = record.record_number as usize;
                let end = start + record.record_length as usize;
                if end > file.len() {
                    return Err(ExceptionCode::IllegalDataAddress);
                }
                out.push(file[start..end].to_vec());
            }
            Ok(Response::ReadFileRecord { records: out })
        }
        Request::WriteFileRecord { records } => {
            for record in records {
                let file = device
                    .files
                    .get_mut(&record.file_number)
                    .ok_or(ExceptionCode::IllegalDataAddress)?;
                let start = record.record_number as usize;
                let end = start + record.words.len();
                if end > file.len() {
                    file.resize(end, 0);
                }
                file[start..end].copy_from_slice(&record.words);
            }
            Ok(Response::WriteFileRecord {
                records: records.clone(),
            })
        }
        Request::MaskWriteRegister {
            addr,
            and_mask,
            or_mask,
        } => {
            if !device.context.validate(BlockKind::HoldingRegister, *addr, 1) {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let current = device
                .context
                .get_words(BlockKind::HoldingRegister, *addr, 1)
                .map_err(|_| ExceptionCode::ServerDeviceFailure)?[0];
            let value = (current & and_mask) | (or_mask & !and_mask);
            device.context.set_words(BlockKind::HoldingRegister, *addr, &[value])
                .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
            Ok(Response::MaskWriteRegister {
                addr: *addr,
                and_mask: *and_mask,
                or_mask: *or_mask,
            })
        }
        Request::ReadWriteMultipleRegisters {
            read_addr,
            read_cnt,
            write_addr,
            values,
        } => {
            if !device.context.validate(BlockKind::HoldingRegister, *read_addr, *read_cnt)
                || !device.context.validate(BlockKind::HoldingRegister, *write_addr, values.len() as u16)
            {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            // the write is performed before the read
            device.context.set_words(BlockKind::HoldingRegister, *write_addr, values)
                .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
            let words = device
                .context
                .get_words(BlockKind::HoldingRegister, *read_addr, *read_cnt)
                .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
            Ok(Response::ReadWriteMultipleRegisters { words })
        }
        Request::ReadFifoQueue { addr } => {
            if !device.context.validate(BlockKind::HoldingRegister, *addr, 1) {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let count = device
                .context
                .get_words(BlockKind::HoldingRegister, *addr, 1)
                .map_err(|_| ExceptionCode::ServerDeviceFailure)?[0];
            if count > 31 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            if !device.context.validate(BlockKind::HoldingRegister, addr.wrapping_add(1), count) {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let words = device
                .context
                .get_words(BlockKind::HoldingRegister, addr.wrapping_add(1), count)
                .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
            Ok(Response::ReadFifoQueue { words })
        }
        Request::ReadDeviceInformation {
            read_code,
            object_id,
        } => {
            let available = device.identity.objects(*read_code, *object_id);
            if available.is_empty() {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            // individual access returns exactly the requested object
            let available = if *read_code == 4 {
                available.into_iter().take(1).collect::<Vec<_>>()
            } else {
                available
            };
            let mut objects = Vec::new();
            let mut size = 8;
            let mut more_follows = false;
            let mut next_object_id = 0;
            for obj in available {
                if size + 2 + obj.value.len() > MAX_PDU_SIZE {
                    more_follows = true;
                    next_object_id = obj.id;
                    break;
                }
                size += 2 + obj.value.len();
                objects.push(obj);
            }
            Ok(Response::ReadDeviceInformation {
                read_code: *read_code,
                conformity: *read_code | 0x80,
                more_follows,
                next_object_id,
                objects,
            })
        }
        Request::Custom { .. } => Err(ExceptionCode::IllegalFunction),
    }
}

/// Drive one server connection: read bytes, feed the framer, dispatch
/// requests, write responses. Returns when the peer closes the stream.
pub async fn serve_connection<T: Transport>(
    mut transport: T,
    framer_kind: mbsrv_protocol::FramerKind,
    dispatcher: &mut ServerDispatcher,
    registry: Option<Arc<FunctionRegistry>>,
) -> Result<()> {
    let mut framer = make_framer(framer_kind, Direction::Request, registry);
    let filter = DeviceFilter::only(dispatcher.device_ids());
    transport.connect().await?;
    loop {
        let data = transport.recv(RECV_CHUNK).await?;
        if data.is_empty() {
            return Ok(());
        }
        let mut events = Vec::new();
        framer.consume(&data, &filter, &mut |event| events.push(event));
        for event in events {
            let (transaction_id, device_id, response) = match event {
                FrameEvent::Frame(frame) => match frame.pdu {
                    Pdu::Request(request) => (
                        frame.transaction_id,
                        frame.device_id,
                        dispatcher.serve(frame.device_id, &request),
                    ),
                    Pdu::Response(_) => continue,
                },
                FrameEvent::DecodeFailure {
                    device_id,
                    transaction_id,
                    function_code,
                    ..
                } => (
                    transaction_id,
                    device_id,
                    dispatcher.serve_decode_failure(device_id, function_code),
                ),
            };
            if let Some(response) = response {
                let bytes = framer.build(&Adu {
                    transaction_id,
                    device_id,
                    pdu: response.encode()?,
                })?;
                transport.send(&bytes).await?;
            }
        }
    }
}
