//! Transport-independent Modbus protocol model.
//!
//! This crate defines the request and response PDU variants, the exception
//! codes, the PDU codec (see [`codec`]) and the frame checksums (see
//! [`checksum`]). Framing and transaction handling live in the `mbsrv` crate;
//! everything here is plain data that both the client and the server side
//! share.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod checksum;
pub mod codec;
pub mod error;
mod bytes;

pub use crate::error::{Error, TransportError};

pub type Result<T> = std::result::Result<T, Error>;

/// Largest PDU (function code + body) that fits any Modbus framing.
pub const MAX_PDU_SIZE: usize = 253;

/// Device id 0 addresses every device on the line; no response is sent.
pub const BROADCAST_DEVICE_ID: u8 = 0;

/// Device id used when the caller does not specify one.
pub const DEFAULT_DEVICE_ID: u8 = 1;

pub mod function_codes {
    pub const READ_COILS: u8 = 1;
    pub const READ_DISCRETE_INPUTS: u8 = 2;
    pub const READ_HOLDING_REGISTERS: u8 = 3;
    pub const READ_INPUT_REGISTERS: u8 = 4;
    pub const WRITE_SINGLE_COIL: u8 = 5;
    pub const WRITE_SINGLE_REGISTER: u8 = 6;
    pub const READ_EXCEPTION_STATUS: u8 = 7;
    pub const DIAGNOSTICS: u8 = 8;
    pub const GET_COMM_EVENT_COUNTER: u8 = 11;
    pub const GET_COMM_EVENT_LOG: u8 = 12;
    pub const WRITE_MULTIPLE_COILS: u8 = 15;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 16;
    pub const REPORT_DEVICE_ID: u8 = 17;
    pub const READ_FILE_RECORD: u8 = 20;
    pub const WRITE_FILE_RECORD: u8 = 21;
    pub const MASK_WRITE_REGISTER: u8 = 22;
    pub const READ_WRITE_MULTIPLE_REGISTERS: u8 = 23;
    pub const READ_FIFO_QUEUE: u8 = 24;
    pub const ENCAPSULATED_INTERFACE: u8 = 0x2B;

    /// MEI type for Read Device Information under fc 0x2B.
    pub const MEI_READ_DEVICE_INFORMATION: u8 = 0x0E;

    /// Set on the request function code in an exception response.
    pub const EXCEPTION_FLAG: u8 = 0x80;
}

/// Diagnostics (fc 8) sub-function codes.
pub mod diagnostic_codes {
    pub const RETURN_QUERY_DATA: u16 = 0x00;
    pub const RESTART_COMMUNICATIONS: u16 = 0x01;
    pub const RETURN_DIAGNOSTIC_REGISTER: u16 = 0x02;
    pub const FORCE_LISTEN_ONLY: u16 = 0x04;
    pub const CLEAR_COUNTERS: u16 = 0x0A;
    pub const RETURN_BUS_MESSAGE_COUNT: u16 = 0x0B;
    pub const RETURN_BUS_COMM_ERROR_COUNT: u16 = 0x0C;
    pub const RETURN_BUS_EXCEPTION_COUNT: u16 = 0x0D;
    pub const RETURN_SERVER_MESSAGE_COUNT: u16 = 0x0E;
    pub const RETURN_SERVER_NO_RESPONSE_COUNT: u16 = 0x0F;
}

/// Object ids served by Read Device Information (fc 43/14).
pub mod device_info_objects {
    pub const VENDOR_NAME: u8 = 0x00;
    pub const PRODUCT_CODE: u8 = 0x01;
    pub const REVISION: u8 = 0x02;
    pub const VENDOR_URL: u8 = 0x03;
    pub const PRODUCT_NAME: u8 = 0x04;
    pub const MODEL_NAME: u8 = 0x05;
    pub const USER_APPLICATION_NAME: u8 = 0x06;
}

/// The four framings the engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FramerKind {
    /// Modbus/TCP with the MBAP envelope.
    Socket,
    /// Binary serial framing with a CRC-16 trailer.
    Rtu,
    /// `:`-delimited hex framing with an LRC trailer.
    Ascii,
    /// RTU frames carried over a TCP stream, without MBAP.
    RtuOverTcp,
}

impl FramerKind {
    /// Serial-style framings allow a single outstanding transaction because
    /// nothing on the wire correlates responses with requests.
    pub fn is_single_outstanding(self) -> bool {
        !matches!(self, FramerKind::Socket)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionCode {
    #[error("Illegal Function")]
    IllegalFunction,
    #[error("Illegal Data Address")]
    IllegalDataAddress,
    #[error("Illegal Data Value")]
    IllegalDataValue,
    #[error("Server Device Failure")]
    ServerDeviceFailure,
    #[error("Acknowledge")]
    Acknowledge,
    #[error("Server Device Busy")]
    ServerDeviceBusy,
    #[error("Memory Parity Error")]
    MemoryParityError,
    #[error("Gateway Path Unavailable")]
    GatewayPathUnavailable,
    #[error("Gateway Target Device Failed to Respond")]
    GatewayTargetFailedToRespond,
    #[error("Unknown Exception Code: {0}")]
    Unknown(u8),
}

impl ExceptionCode {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => ExceptionCode::IllegalFunction,
            2 => ExceptionCode::IllegalDataAddress,
            3 => ExceptionCode::IllegalDataValue,
            4 => ExceptionCode::ServerDeviceFailure,
            5 => ExceptionCode::Acknowledge,
            6 => ExceptionCode::ServerDeviceBusy,
            7 => ExceptionCode::MemoryParityError,
            10 => ExceptionCode::GatewayPathUnavailable,
            11 => ExceptionCode::GatewayTargetFailedToRespond,
            x => ExceptionCode::Unknown(x),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 1,
            ExceptionCode::IllegalDataAddress => 2,
            ExceptionCode::IllegalDataValue => 3,
            ExceptionCode::ServerDeviceFailure => 4,
            ExceptionCode::Acknowledge => 5,
            ExceptionCode::ServerDeviceBusy => 6,
            ExceptionCode::MemoryParityError => 7,
            ExceptionCode::GatewayPathUnavailable => 10,
            ExceptionCode::GatewayTargetFailedToRespond => 11,
            ExceptionCode::Unknown(x) => x,
        }
    }
}

/// One record reference inside a Read File Record request (reference type 6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecordRef {
    pub file_number: u16,
    pub record_number: u16,
    pub record_length: u16,
}

/// One record inside a Write File Record request, carrying the record words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_number: u16,
    pub record_number: u16,
    pub words: Vec<u16>,
}

/// One identification object in a Read Device Information response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfoObject {
    pub id: u8,
    #[serde(with = "bytes")]
    pub value: Vec<u8>,
}

/// A request PDU, from client (master) to server (slave).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    ReadCoils {
        addr: u16,
        cnt: u16,
    },
    ReadDiscreteInputs {
        addr: u16,
        cnt: u16,
    },
    ReadHoldingRegisters {
        addr: u16,
        cnt: u16,
    },
    ReadInputRegisters {
        addr: u16,
        cnt: u16,
    },
    WriteSingleCoil {
        addr: u16,
        value: bool,
    },
    WriteSingleRegister {
        addr: u16,
        value: u16,
    },
    ReadExceptionStatus,
    /// Sub-function plus one 16-bit data word, per the serial-line spec.
    Diagnostics {
        sub_function: u16,
        data: u16,
    },
    GetCommEventCounter,
    GetCommEventLog,
    WriteMultipleCoils {
        addr: u16,
        values: Vec<bool>,
    },
    WriteMultipleRegisters {
        addr: u16,
        values: Vec<u16>,
    },
    ReportDeviceId,
    ReadFileRecord {
        records: Vec<FileRecordRef>,
    },
    WriteFileRecord {
        records: Vec<FileRecord>,
    },
    MaskWriteRegister {
        addr: u16,
        and_mask: u16,
        or_mask: u16,
    },
    ReadWriteMultipleRegisters {
        read_addr: u16,
        read_cnt: u16,
        write_addr: u16,
        values: Vec<u16>,
    },
    ReadFifoQueue {
        addr: u16,
    },
    ReadDeviceInformation {
        read_code: u8,
        object_id: u8,
    },
    /// A registered custom function code with an opaque body.
    Custom {
        function_code: u8,
        #[serde(with = "bytes")]
        data: Vec<u8>,
    },
}

/// A response PDU, from server back to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    ReadCoils {
        bits: Vec<bool>,
    },
    ReadDiscreteInputs {
        bits: Vec<bool>,
    },
    ReadHoldingRegisters {
        words: Vec<u16>,
    },
    ReadInputRegisters {
        words: Vec<u16>,
    },
    WriteSingleCoil {
        addr: u16,
        value: bool,
    },
    WriteSingleRegister {
        addr: u16,
        value: u16,
    },
    ReadExceptionStatus {
        status: u8,
    },
    Diagnostics {
        sub_function: u16,
        data: u16,
    },
    GetCommEventCounter {
        status: u16,
        event_count: u16,
    },
    GetCommEventLog {
        status: u16,
        event_count: u16,
        message_count: u16,
        #[serde(with = "bytes")]
        events: Vec<u8>,
    },
    WriteMultipleCoils {
        addr: u16,
        cnt: u16,
    },
    WriteMultipleRegisters {
        addr: u16,
        cnt: u16,
    },
    ReportDeviceId {
        #[serde(with = "bytes")]
        data: Vec<u8>,
    },
    ReadFileRecord {
        records: Vec<Vec<u16>>,
    },
    WriteFileRecord {
        records: Vec<FileRecord>,
    },
    MaskWriteRegister {
        addr: u16,
        and_mask: u16,
        or_mask: u16,
    },
    ReadWriteMultipleRegisters {
        words: Vec<u16>,
    },
    ReadFifoQueue {
        words: Vec<u16>,
    },
    ReadDeviceInformation {
        read_code: u8,
        conformity: u8,
        more_follows: bool,
        next_object_id: u8,
        objects: Vec<DeviceInfoObject>,
    },
    Custom {
        function_code: u8,
        #[serde(with = "bytes")]
        data: Vec<u8>,
    },
    /// Exception response: request function code plus an exception byte.
    Exception {
        function_code: u8,
        code: ExceptionCode,
    },
}

impl Request {
    pub fn function_code(&self) -> u8 {
        use function_codes::*;
        match self {
            Request::ReadCoils { .. } => READ_COILS,
            Request::ReadDiscreteInputs { .. } => READ_DISCRETE_INPUTS,
            Request::ReadHoldingRegisters { .. } => READ_HOLDING_REGISTERS,
            Request::ReadInputRegisters { .. } => READ_INPUT_REGISTERS,
            Request::WriteSingleCoil { .. } => WRITE_SINGLE_COIL,
            Request::WriteSingleRegister { .. } => WRITE_SINGLE_REGISTER,
            Request::ReadExceptionStatus => READ_EXCEPTION_STATUS,
            Request::Diagnostics { .. } => DIAGNOSTICS,
            Request::GetCommEventCounter => GET_COMM_EVENT_COUNTER,
            Request::GetCommEventLog => GET_COMM_EVENT_LOG,
            Request::WriteMultipleCoils { .. } => WRITE_MULTIPLE_COILS,
            Request::WriteMultipleRegisters { .. } => WRITE_MULTIPLE_REGISTERS,
            Request::ReportDeviceId => REPORT_DEVICE_ID,
            Request::ReadFileRecord { .. } => READ_FILE_RECORD,
            Request::WriteFileRecord { .. } => WRITE_FILE_RECORD,
            Request::MaskWriteRegister { .. } => MASK_WRITE_REGISTER,
            Request::ReadWriteMultipleRegisters { .. } => READ_WRITE_MULTIPLE_REGISTERS,
            Request::ReadFifoQueue { .. } => READ_FIFO_QUEUE,
            Request::ReadDeviceInformation { .. } => ENCAPSULATED_INTERFACE,
            Request::Custom { function_code, .. } => *function_code,
        }
    }

    /// True for operations that expect data back and therefore cannot be
    /// broadcast.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Request::ReadCoils { .. }
                | Request::ReadDiscreteInputs { .. }
                | Request::ReadHoldingRegisters { .. }
                | Request::ReadInputRegisters { .. }
                | Request::ReadExceptionStatus
                | Request::Diagnostics { .. }
                | Request::GetCommEventCounter
                | Request::GetCommEventLog
                | Request::ReportDeviceId
                | Request::ReadFileRecord { .. }
                | Request::ReadWriteMultipleRegisters { .. }
                | Request::ReadFifoQueue { .. }
                | Request::ReadDeviceInformation { .. }
        )
    }
}

impl Response {
    pub fn function_code(&self) -> u8 {
        use function_codes::*;
        match self {
            Response::ReadCoils { .. } => READ_COILS,
            Response::ReadDiscreteInputs { .. } => READ_DISCRETE_INPUTS,
            Response::ReadHoldingRegisters { .. } => READ_HOLDING_REGISTERS,
            Response::ReadInputRegisters { .. } => READ_INPUT_REGISTERS,
            Response::WriteSingleCoil { .. } => WRITE_SINGLE_COIL,
            Response::WriteSingleRegister { .. } => WRITE_SINGLE_REGISTER,
            Response::ReadExceptionStatus { .. } => READ_EXCEPTION_STATUS,
            Response::Diagnostics { .. } => DIAGNOSTICS,
            Response::GetCommEventCounter { .. } => GET_COMM_EVENT_COUNTER,
            Response::GetCommEventLog { .. } => GET_COMM_EVENT_LOG,
            Response::WriteMultipleCoils { .. } => WRITE_MULTIPLE_COILS,
            Response::WriteMultipleRegisters { .. } => WRITE_MULTIPLE_REGISTERS,
            Response::ReportDeviceId { .. } => REPORT_DEVICE_ID,
            Response::ReadFileRecord { .. } => READ_FILE_RECORD,
            Response::WriteFileRecord { .. } => WRITE_FILE_RECORD,
            Response::MaskWriteRegister { .. } => MASK_WRITE_REGISTER,
            Response::ReadWriteMultipleRegisters { .. } => READ_WRITE_MULTIPLE_REGISTERS,
            Response::ReadFifoQueue { .. } => READ_FIFO_QUEUE,
            Response::ReadDeviceInformation { .. } => ENCAPSULATED_INTERFACE,
            Response::Custom { function_code, .. } => *function_code,
            Response::Exception { function_code, .. } => {
                *function_code | function_codes::EXCEPTION_FLAG
            }
        }
    }

    pub fn exception(function_code: u8, code: ExceptionCode) -> Self {
        Response::Exception {
            function_code: function_code & !function_codes::EXCEPTION_FLAG,
            code,
        }
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, Response::Exception { .. })
    }

    /// Turns an exception response into the matching error, passing every
    /// other response through.
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Exception { code, .. } => Err(Error::Exception(code)),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_exception_code_round_trip() {
        for code in 1..=11_u8 {
            assert_eq!(ExceptionCode::from_code(code).code(), code);
        }
        assert_eq!(ExceptionCode::from_code(0x42), ExceptionCode::Unknown(0x42));
    }

    #[test]
    fn test_exception_function_code_carries_flag() {
        let resp = Response::exception(3, ExceptionCode::IllegalDataAddress);
        assert_eq!(resp.function_code(), 0x83);
        assert!(resp.is_exception());
        assert!(matches!(
            resp.into_result(),
            Err(Error::Exception(ExceptionCode::IllegalDataAddress))
        ));
    }

    #[test]
    fn test_broadcastable() {
        assert!(Request::ReadCoils { addr: 0, cnt: 1 }.is_read());
        assert!(!Request::WriteSingleCoil {
            addr: 0,
            value: true
        }
        .is_read());
        assert!(!Request::WriteMultipleRegisters {
            addr: 0,
            values: vec![1]
        }
        .is_read());
    }

    #[test]
    fn test_request_serializes() {
        let req = Request::Custom {
            function_code: 0x44,
            data: vec![1, 2, 3],
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(req, back);
    }
}
