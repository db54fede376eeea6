//! Encoding and decoding of request and response PDUs.
//!
//! A PDU is the function code byte followed by the function-specific body.
//! Decoders reject byte-count fields that disagree with the trailing payload,
//! so a server can translate any [`Error::Decode`] at this boundary into an
//! Illegal Data Value exception and a client can drop the frame.
//!
//! [`request_pdu_len`] and [`response_pdu_len`] answer "how long is the PDU
//! starting at these bytes" from the shortest prefix that determines it, which
//! is what the RTU framers need to find frame boundaries without gaps.

use byteorder::{BigEndian, ByteOrder};

use crate::function_codes as fc;
use crate::{
    DeviceInfoObject, Error, ExceptionCode, FileRecord, FileRecordRef, Request, Response, Result,
    MAX_PDU_SIZE,
};

const MAX_READ_BITS: u16 = 2000;
const MAX_READ_WORDS: u16 = 125;
const MAX_WRITE_BITS: u16 = 1968;
const MAX_WRITE_WORDS: u16 = 123;
const MAX_RW_READ_WORDS: u16 = 121;
const MAX_RW_WRITE_WORDS: u16 = 121;
const MAX_FIFO_WORDS: u16 = 31;

/// Pack bits in logical order, least-significant bit first within each byte.
/// The last byte is zero-padded.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0_u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

/// Unpack `cnt` bits packed by [`pack_bits`].
pub fn unpack_bits(bytes: &[u8], cnt: usize) -> Vec<bool> {
    let mut out = Vec::with_capacity(cnt);
    for i in 0..cnt {
        out.push(bytes[i / 8] & (1 << (i % 8)) != 0);
    }
    out
}

fn be_u16(data: &[u8], pos: usize) -> u16 {
    BigEndian::read_u16(&data[pos..pos + 2])
}

fn check_range(what: &str, cnt: u16, max: u16) -> Result<()> {
    if cnt == 0 || cnt > max {
        return Err(Error::invalid_request(anyhow::anyhow!(
            "{} count out of range: {} (1..={})",
            what,
            cnt,
            max
        )));
    }
    Ok(())
}

fn expect_len(data: &[u8], expected: usize) -> Result<()> {
    if data.len() != expected {
        return Err(Error::decode(format!(
            "PDU length {} does not match expected {}",
            data.len(),
            expected
        )));
    }
    Ok(())
}

fn words_from_be(data: &[u8]) -> Vec<u16> {
    data.chunks(2).map(|x| u16::from_be_bytes([x[0], x[1]])).collect()
}

fn push_words(out: &mut Vec<u8>, words: &[u16]) {
    for x in words {
        out.extend(&x.to_be_bytes());
    }
}

/// Expected total request PDU length from the leading bytes. `None` means the
/// prefix is too short to tell yet.
pub fn request_pdu_len(data: &[u8]) -> Result<Option<usize>> {
    if data.is_empty() {
        return Ok(None);
    }
    let len = match data[0] {
        fc::READ_COILS
        | fc::READ_DISCRETE_INPUTS
        | fc::READ_HOLDING_REGISTERS
        | fc::READ_INPUT_REGISTERS
        | fc::WRITE_SINGLE_COIL
        | fc::WRITE_SINGLE_REGISTER
        | fc::DIAGNOSTICS => Some(5),
        fc::READ_EXCEPTION_STATUS
        | fc::GET_COMM_EVENT_COUNTER
        | fc::GET_COMM_EVENT_LOG
        | fc::REPORT_DEVICE_ID => Some(1),
        fc::WRITE_MULTIPLE_COILS | fc::WRITE_MULTIPLE_REGISTERS => {
            if data.len() > 5 {
                Some(6 + data[5] as usize)
            } else {
                None
            }
        }
        fc::READ_FILE_RECORD | fc::WRITE_FILE_RECORD => {
            if data.len() > 1 {
                Some(2 + data[1] as usize)
            } else {
                None
            }
        }
        fc::MASK_WRITE_REGISTER => Some(7),
        fc::READ_WRITE_MULTIPLE_REGISTERS => {
            if data.len() > 9 {
                Some(10 + data[9] as usize)
            } else {
                None
            }
        }
        fc::READ_FIFO_QUEUE => Some(3),
        fc::ENCAPSULATED_INTERFACE => Some(4),
        x => {
            return Err(Error::decode(format!(
                "unknown request function code: 0x{:02X}",
                x
            )))
        }
    };
    Ok(len)
}

/// Expected total response PDU length from the leading bytes. `None` means the
/// prefix is too short to tell yet.
pub fn response_pdu_len(data: &[u8]) -> Result<Option<usize>> {
    if data.is_empty() {
        return Ok(None);
    }
    if data[0] & fc::EXCEPTION_FLAG != 0 {
        return Ok(Some(2));
    }
    let len = match data[0] {
        fc::READ_COILS
        | fc::READ_DISCRETE_INPUTS
        | fc::READ_HOLDING_REGISTERS
        | fc::READ_INPUT_REGISTERS
        | fc::GET_COMM_EVENT_LOG
        | fc::REPORT_DEVICE_ID
        | fc::READ_FILE_RECORD
        | fc::WRITE_FILE_RECORD
        | fc::READ_WRITE_MULTIPLE_REGISTERS => {
            if data.len() > 1 {
                Some(2 + data[1] as usize)
            } else {
                None
            }
        }
        fc::WRITE_SINGLE_COIL
        | fc::WRITE_SINGLE_REGISTER
        | fc::WRITE_MULTIPLE_COILS
        | fc::WRITE_MULTIPLE_REGISTERS
        | fc::DIAGNOSTICS
        | fc::GET_COMM_EVENT_COUNTER => Some(5),
        fc::READ_EXCEPTION_STATUS => Some(2),
        fc::MASK_WRITE_REGISTER => Some(7),
        fc::READ_FIFO_QUEUE => {
            if data.len() > 2 {
                Some(3 + be_u16(data, 1) as usize)
            } else {
                None
            }
        }
        fc::ENCAPSULATED_INTERFACE => return device_information_len(data),
        x => {
            return Err(Error::decode(format!(
                "unknown response function code: 0x{:02X}",
                x
            )))
        }
    };
    Ok(len)
}

/// A Read Device Information response is only delimited by walking its object
/// list.
fn device_information_len(data: &[u8]) -> Result<Option<usize>> {
    if data.len() < 7 {
        return Ok(None);
    }
    let object_count = data[6] as usize;
    let mut pos = 7;
    for _ in 0..object_count {
        if data.len() < pos + 2 {
            return Ok(None);
        }
        pos += 2 + data[pos + 1] as usize;
    }
    Ok(Some(pos))
}

impl Request {
    /// Validate the request against the protocol limits without encoding it.
    pub fn validate(&self) -> Result<()> {
        match self {
            Request::ReadCoils { cnt, .. } | Request::ReadDiscreteInputs { cnt, .. } => {
                check_range("bit read", *cnt, MAX_READ_BITS)
            }
            Request::ReadHoldingRegisters { cnt, .. } | Request::ReadInputRegisters { cnt, .. } => {
                check_range("register read", *cnt, MAX_READ_WORDS)
            }
            Request::WriteMultipleCoils { values, .. } => {
                check_range("bit write", values.len() as u16, MAX_WRITE_BITS)
            }
            Request::WriteMultipleRegisters { values, .. } => {
                check_range("register write", values.len() as u16, MAX_WRITE_WORDS)
            }
            Request::ReadWriteMultipleRegisters {
                read_cnt, values, ..
            } => {
                check_range("register read", *read_cnt, MAX_RW_READ_WORDS)?;
                check_range("register write", values.len() as u16, MAX_RW_WRITE_WORDS)
            }
            Request::ReadFileRecord { records } => {
                if records.is_empty() || records.len() * 7 > 0xF5 {
                    return Err(Error::invalid_request(anyhow::anyhow!(
                        "file record count out of range: {}",
                        records.len()
                    )));
                }
                Ok(())
            }
            Request::WriteFileRecord { records } => {
                let total: usize = records.iter().map(|r| 7 + 2 * r.words.len()).sum();
                if records.is_empty() || total > 0xFB {
                    return Err(Error::invalid_request(anyhow::anyhow!(
                        "file record payload out of range: {} bytes",
                        total
                    )));
                }
                Ok(())
            }
            Request::ReadDeviceInformation { read_code, .. } => {
                if !(1..=4).contains(read_code) {
                    return Err(Error::invalid_request(anyhow::anyhow!(
                        "device information read code out of range: {}",
                        read_code
                    )));
                }
                Ok(())
            }
            Request::Custom { data, .. } => {
                if data.len() + 1 > MAX_PDU_SIZE {
                    return Err(Error::invalid_request(anyhow::anyhow!(
                        "custom PDU too large: {} bytes",
                        data.len() + 1
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Append the encoded PDU (function code + body) to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        self.validate()?;
        out.push(self.function_code());
        match self {
            Request::ReadCoils { addr, cnt }
            | Request::ReadDiscreteInputs { addr, cnt }
            | Request::ReadHoldingRegisters { addr, cnt }
            | Request::ReadInputRegisters { addr, cnt } => {
                out.extend(&addr.to_be_bytes());
                out.extend(&cnt.to_be_bytes());
            }
            Request::WriteSingleCoil { addr, value } => {
                out.extend(&addr.to_be_bytes());
                out.extend(&if *value { [0xFF, 0x00] } else { [0x00, 0x00] });
            }
            Request::WriteSingleRegister { addr, value } => {
                out.extend(&addr.to_be_bytes());
                out.extend(&value.to_be_bytes());
            }
            Request::ReadExceptionStatus
            | Request::GetCommEventCounter
            | Request::GetCommEventLog
            | Request::ReportDeviceId => {}
            Request::Diagnostics { sub_function, data } => {
                out.extend(&sub_function.to_be_bytes());
                out.extend(&data.to_be_bytes());
            }
            Request::WriteMultipleCoils { addr, values } => {
                out.extend(&addr.to_be_bytes());
                out.extend(&(values.len() as u16).to_be_bytes());
                let packed = pack_bits(values);
                out.push(packed.len() as u8);
                out.extend(&packed);
            }
            Request::WriteMultipleRegisters { addr, values } => {
                out.extend(&addr.to_be_bytes());
                out.extend(&(values.len() as u16).to_be_bytes());
                out.push(2 * values.len() as u8);
                push_words(out, values);
            }
            Request::ReadFileRecord { records } => {
                out.push((records.len() * 7) as u8);
                for r in records {
                    out.push(6);
                    out.extend(&r.file_number.to_be_bytes());
                    out.extend(&r.record_number.to_be_bytes());
                    out.extend(&r.record_length.to_be_bytes());
                }
            }
            Request::WriteFileRecord { records } => {
                let total: usize = records.iter().map(|r| 7 + 2 * r.words.len()).sum();
                out.push(total as u8);
                for r in records {
                    out.push(6);
                    out.extend(&r.file_number.to_be_bytes());
                    out.extend(&r.record_number.to_be_bytes());
                    out.extend(&(r.words.len() as u16).to_be_bytes());
                    push_words(out, &r.words);
                }
            }
            Request::MaskWriteRegister {
                addr,
                and_mask,
                or_mask,
            } => {
                out.extend(&addr.to_be_bytes());
                out.extend(&and_mask.to_be_bytes());
                out.extend(&or_mask.to_be_bytes());
            }
            Request::ReadWriteMultipleRegisters {
                read_addr,
                read_cnt,
                write_addr,
                values,
            } => {
                out.extend(&read_addr.to_be_bytes());
                out.extend(&read_cnt.to_be_bytes());
                out.extend(&write_addr.to_be_bytes());
                out.extend(&(values.len() as u16).to_be_bytes());
                out.push(2 * values.len() as u8);
                push_words(out, values);
            }
            Request::ReadFifoQueue { addr } => {
                out.extend(&addr.to_be_bytes());
            }
            Request::ReadDeviceInformation {
                read_code,
                object_id,
            } => {
                out.push(fc::MEI_READ_DEVICE_INFORMATION);
                out.push(*read_code);
                out.push(*object_id);
            }
            Request::Custom { data, .. } => {
                out.extend(data);
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Decode a request PDU. Counts, byte-count fields and trailing payload
    /// must all agree.
    pub fn decode(data: &[u8]) -> Result<Request> {
        if data.is_empty() {
            return Err(Error::decode("empty request PDU"));
        }
        let ret = match data[0] {
            fc::READ_COILS | fc::READ_DISCRETE_INPUTS => {
                expect_len(data, 5)?;
                let addr = be_u16(data, 1);
                let cnt = be_u16(data, 3);
                if cnt == 0 || cnt > MAX_READ_BITS {
                    return Err(Error::decode(format!("bit read count out of range: {}", cnt)));
                }
                if data[0] == fc::READ_COILS {
                    Request::ReadCoils { addr, cnt }
                } else {
                    Request::ReadDiscreteInputs { addr, cnt }
                }
            }
            fc::READ_HOLDING_REGISTERS | fc::READ_INPUT_REGISTERS => {
                expect_len(data, 5)?;
                let addr = be_u16(data, 1);
                let cnt = be_u16(data, 3);
                if cnt == 0 || cnt > MAX_READ_WORDS {
                    return Err(Error::decode(format!(
                        "register read count out of range: {}",
                        cnt
                    )));
                }
                if data[0] == fc::READ_HOLDING_REGISTERS {
                    Request::ReadHoldingRegisters { addr, cnt }
                } else {
                    Request::ReadInputRegisters { addr, cnt }
                }
            }
            fc::WRITE_SINGLE_COIL => {
                expect_len(data, 5)?;
                let addr = be_u16(data, 1);
                let value = match be_u16(data, 3) {
                    0xFF00 => true,
                    0x0000 => false,
                    x => {
                        return Err(Error::decode(format!("invalid coil value: 0x{:04X}", x)));
                    }
                };
                Request::WriteSingleCoil { addr, value }
            }
            fc::WRITE_SINGLE_REGISTER => {
                expect_len(data, 5)?;
                Request::WriteSingleRegister {
                    addr: be_u16(data, 1),
                    value: be_u16(data, 3),
                }
            }
            fc::READ_EXCEPTION_STATUS => {
                expect_len(data, 1)?;
                Request::ReadExceptionStatus
            }
            fc::DIAGNOSTICS => {
                expect_len(data, 5)?;
                Request::Diagnostics {
                    sub_function: be_u16(data, 1),
                    data: be_u16(data, 3),
                }
            }
            fc::GET_COMM_EVENT_COUNTER => {
                expect_len(data, 1)?;
                Request::GetCommEventCounter
            }
            fc::GET_COMM_EVENT_LOG => {
                expect_len(data, 1)?;
                Request::GetCommEventLog
            }
            fc::WRITE_MULTIPLE_COILS => {
                if data.len() < 6 {
                    return Err(Error::decode("write multiple coils request too short"));
                }
                let addr = be_u16(data, 1);
                let cnt = be_u16(data, 3);
                let byte_count = data[5] as usize;
                if cnt == 0 || cnt > MAX_WRITE_BITS {
                    return Err(Error::decode(format!("bit write count out of range: {}", cnt)));
                }
                if byte_count != (cnt as usize + 7) / 8 {
                    return Err(Error::decode(format!(
                        "byte count {} does not match bit count {}",
                        byte_count, cnt
                    )));
                }
                expect_len(data, 6 + byte_count)?;
                Request::WriteMultipleCoils {
                    addr,
                    values: unpack_bits(&data[6..], cnt as usize),
                }
            }
            fc::WRITE_MULTIPLE_REGISTERS => {
                if data.len() < 6 {
                    return Err(Error::decode("write multiple registers request too short"));
                }
                let addr = be_u16(data, 1);
                let cnt = be_u16(data, 3);
                let byte_count = data[5] as usize;
                if cnt == 0 || cnt > MAX_WRITE_WORDS {
                    return Err(Error::decode(format!(
                        "register write count out of range: {}",
                        cnt
                    )));
                }
                if byte_count != 2 * cnt as usize {
                    return Err(Error::decode(format!(
                        "byte count {} does not match register count {}",
                        byte_count, cnt
                    )));
                }
                expect_len(data, 6 + byte_count)?;
                Request::WriteMultipleRegisters {
                    addr,
                    values: words_from_be(&data[6..]),
                }
            }
            fc::REPORT_DEVICE_ID => {
                expect_len(data, 1)?;
                Request::ReportDeviceId
            }
            fc::READ_FILE_RECORD => {
                if data.len() < 2 {
                    return Err(Error::decode("read file record request too short"));
                }
                let byte_count = data[1] as usize;
                expect_len(data, 2 + byte_count)?;
                if byte_count < 7 || byte_count % 7 != 0 {
                    return Err(Error::decode(format!(
                        "invalid file record byte count: {}",
                        byte_count
                    )));
                }
                let mut records = Vec::with_capacity(byte_count / 7);
                for chunk in data[2..].chunks(7) {
                    if chunk[0] != 6 {
                        return Err(Error::decode(format!(
                            "invalid file record reference type: {}",
                            chunk[0]
                        )));
                    }
                    records.push(FileRecordRef {
                        file_number: be_u16(chunk, 1),
                        record_number: be_u16(chunk, 3),
                        record_length: be_u16(chunk, 5),
                    });
                }
                Request::ReadFileRecord { records }
            }
            fc::WRITE_FILE_RECORD => {
                if data.len() < 2 {
                    return Err(Error::decode("write file record request too short"));
                }
                let byte_count = data[1] as usize;
                expect_len(data, 2 + byte_count)?;
                Request::WriteFileRecord {
                    records: decode_file_records(&data[2..])?,
                }
            }
            fc::MASK_WRITE_REGISTER => {
                expect_len(data, 7)?;
                Request::MaskWriteRegister {
                    addr: be_u16(data, 1),
                    and_mask: be_u16(data, 3),
                    or_mask: be_u16(data, 5),
                }
            }
            fc::READ_WRITE_MULTIPLE_REGISTERS => {
                if data.len() < 10 {
                    return Err(Error::decode("read/write multiple request too short"));
                }
                let read_addr = be_u16(data, 1);
                let read_cnt = be_u16(data, 3);
                let write_addr = be_u16(data, 5);
                let write_cnt = be_u16(data, 7);
                let byte_count = data[9] as usize;
                if read_cnt == 0 || read_cnt > MAX_RW_READ_WORDS {
                    return Err(Error::decode(format!(
                        "read count out of range: {}",
                        read_cnt
                    )));
                }
                if write_cnt == 0 || write_cnt > MAX_RW_WRITE_WORDS {
                    return Err(Error::decode(format!(
                        "write count out of range: {}",
                        write_cnt
                    )));
                }
                if byte_count != 2 * write_cnt as usize {
                    return Err(Error::decode(format!(
                        "byte count {} does not match write count {}",
                        byte_count, write_cnt
                    )));
                }
                expect_len(data, 10 + byte_count)?;
                Request::ReadWriteMultipleRegisters {
                    read_addr,
                    read_cnt,
                    write_addr,
                    values: words_from_be(&data[10..]),
                }
            }
            fc::READ_FIFO_QUEUE => {
                expect_len(data, 3)?;
                Request::ReadFifoQueue {
                    addr: be_u16(data, 1),
                }
            }
            fc::ENCAPSULATED_INTERFACE => {
                expect_len(data, 4)?;
                if data[1] != fc::MEI_READ_DEVICE_INFORMATION {
                    return Err(Error::decode(format!("unsupported MEI type: 0x{:02X}", data[1])));
                }
                let read_code = data[2];
                if !(1..=4).contains(&read_code) {
                    return Err(Error::decode(format!(
                        "device information read code out of range: {}",
                        read_code
                    )));
                }
                Request::ReadDeviceInformation {
                    read_code,
                    object_id: data[3],
                }
            }
            x => {
                return Err(Error::decode(format!(
                    "unknown request function code: 0x{:02X}",
                    x
                )))
            }
        };
        Ok(ret)
    }
}

fn decode_file_records(mut data: &[u8]) -> Result<Vec<FileRecord>> {
    let mut records = Vec::new();
    while !data.is_empty() {
        if data.len() < 7 {
            return Err(Error::decode("truncated file record group"));
        }
        if data[0] != 6 {
            return Err(Error::decode(format!(
                "invalid file record reference type: {}",
                data[0]
            )));
        }
        let record_length = be_u16(data, 5) as usize;
        if data.len() < 7 + 2 * record_length {
            return Err(Error::decode("file record data shorter than record length"));
        }
        records.push(FileRecord {
            file_number: be_u16(data, 1),
            record_number: be_u16(data, 3),
            words: words_from_be(&data[7..7 + 2 * record_length]),
        });
        data = &data[7 + 2 * record_length..];
    }
    if records.is_empty() {
        return Err(Error::decode("empty file record request"));
    }
    Ok(records)
}

impl Response {
    /// Append the encoded PDU to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(self.function_code());
        match self {
            Response::ReadCoils { bits } | Response::ReadDiscreteInputs { bits } => {
                let packed = pack_bits(bits);
                out.push(packed.len() as u8);
                out.extend(&packed);
            }
            Response::ReadHoldingRegisters { words } | Response::ReadInputRegisters { words } => {
                out.push(2 * words.len() as u8);
                push_words(out, words);
            }
            Response::WriteSingleCoil { addr, value } => {
                out.extend(&addr.to_be_bytes());
                out.extend(&if *value { [0xFF, 0x00] } else { [0x00, 0x00] });
            }
            Response::WriteSingleRegister { addr, value } => {
                out.extend(&addr.to_be_bytes());
                out.extend(&value.to_be_bytes());
            }
            Response::ReadExceptionStatus { status } => {
                out.push(*status);
            }
            Response::Diagnostics { sub_function, data } => {
                out.extend(&sub_function.to_be_bytes());
                out.extend(&data.to_be_bytes());
            }
            Response::GetCommEventCounter {
                status,
                event_count,
            } => {
                out.extend(&status.to_be_bytes());
                out.extend(&event_count.to_be_bytes());
            }
            Response::GetCommEventLog {
                status,
                event_count,
                message_count,
                events,
            } => {
                out.push((6 + events.len()) as u8);
                out.extend(&status.to_be_bytes());
                out.extend(&event_count.to_be_bytes());
                out.extend(&message_count.to_be_bytes());
                out.extend(events);
            }
            Response::WriteMultipleCoils { addr, cnt }
            | Response::WriteMultipleRegisters { addr, cnt } => {
                out.extend(&addr.to_be_bytes());
                out.extend(&cnt.to_be_bytes());
            }
            Response::ReportDeviceId { data } => {
                out.push(data.len() as u8);
                out.extend(data);
            }
            Response::ReadFileRecord { records } => {
                let total: usize = records.iter().map(|r| 2 + 2 * r.len()).sum();
                out.push(total as u8);
                for r in records {
                    out.push((1 + 2 * r.len()) as u8);
                    out.push(6);
                    push_words(out, r);
                }
            }
            Response::WriteFileRecord { records } => {
                let total: usize = records.iter().map(|r| 7 + 2 * r.words.len()).sum();
                out.push(total as u8);
                for r in records {
                    out.push(6);
                    out.extend(&r.file_number.to_be_bytes());
                    out.extend(&r.record_number.to_be_bytes());
                    out.extend(&(r.words.len() as u16).to_be_bytes());
                    push_words(out, &r.words);
                }
            }
            Response::MaskWriteRegister {
                addr,
                and_mask,
                or_mask,
            } => {
                out.extend(&addr.to_be_bytes());
                out.extend(&and_mask.to_be_bytes());
                out.extend(&or_mask.to_be_bytes());
            }
            Response::ReadWriteMultipleRegisters { words } => {
                out.push(2 * words.len() as u8);
                push_words(out, words);
            }
            Response::ReadFifoQueue { words } => {
                out.extend(&(2 * (words.len() as u16 + 1)).to_be_bytes());
                out.extend(&(words.len() as u16).to_be_bytes());
                push_words(out, words);
            }
            Response::ReadDeviceInformation {
                read_code,
                conformity,
                more_follows,
                next_object_id,
                objects,
            } => {
                out.push(fc::MEI_READ_DEVICE_INFORMATION);
                out.push(*read_code);
                out.push(*conformity);
                out.push(if *more_follows { 0xFF } else { 0x00 });
                out.push(*next_object_id);
                out.push(objects.len() as u8);
                for obj in objects {
                    out.push(obj.id);
                    out.push(obj.value.len() as u8);
                    out.extend(&obj.value);
                }
            }
            Response::Custom { data, .. } => {
                out.extend(data);
            }
            Response::Exception { code, .. } => {
                out.push(code.code());
            }
        }
        if out.len() > MAX_PDU_SIZE {
            return Err(Error::internal(anyhow::anyhow!(
                "encoded response PDU too large: {} bytes",
                out.len()
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Decode a response PDU. Bit reads yield all bits of the payload bytes;
    /// the caller truncates to the requested count.
    pub fn decode(data: &[u8]) -> Result<Response> {
        if data.is_empty() {
            return Err(Error::decode("empty response PDU"));
        }
        if data[0] & fc::EXCEPTION_FLAG != 0 {
            expect_len(data, 2)?;
            return Ok(Response::Exception {
                function_code: data[0] & !fc::EXCEPTION_FLAG,
                code: ExceptionCode::from_code(data[1]),
            });
        }
        let ret = match data[0] {
            fc::READ_COILS | fc::READ_DISCRETE_INPUTS => {
                let byte_count = byte_count_field(data)?;
                let bits = unpack_bits(&data[2..], 8 * byte_count);
                if data[0] == fc::READ_COILS {
                    Response::ReadCoils { bits }
                } else {
                    Response::ReadDiscreteInputs { bits }
                }
            }
            fc::READ_HOLDING_REGISTERS | fc::READ_INPUT_REGISTERS => {
                let byte_count = byte_count_field(data)?;
                if byte_count % 2 != 0 {
                    return Err(Error::decode(format!("odd register byte count: {}", byte_count)));
                }
                let words = words_from_be(&data[2..]);
                if data[0] == fc::READ_HOLDING_REGISTERS {
                    Response::ReadHoldingRegisters { words }
                } else {
                    Response::ReadInputRegisters { words }
                }
            }
            fc::WRITE_SINGLE_COIL => {
                expect_len(data, 5)?;
                let value = match be_u16(data, 3) {
                    0xFF00 => true,
                    0x0000 => false,
                    x => {
                        return Err(Error::decode(format!("invalid coil value: 0x{:04X}", x)));
                    }
                };
                Response::WriteSingleCoil {
                    addr: be_u16(data, 1),
                    value,
                }
            }
            fc::WRITE_SINGLE_REGISTER => {
                expect_len(data, 5)?;
                Response::WriteSingleRegister {
                    addr: be_u16(data, 1),
                    value: be_u16(data, 3),
                }
            }
            fc::READ_EXCEPTION_STATUS => {
                expect_len(data, 2)?;
                Response::ReadExceptionStatus { status: data[1] }
            }
            fc::DIAGNOSTICS => {
                expect_len(data, 5)?;
                Response::Diagnostics {
                    sub_function: be_u16(data, 1),
                    data: be_u16(data, 3),
                }
            }
            fc::GET_COMM_EVENT_COUNTER => {
                expect_len(data, 5)?;
                Response::GetCommEventCounter {
                    status: be_u16(data, 1),
                    event_count: be_u16(data, 3),
                }
            }
            fc::GET_COMM_EVENT_LOG => {
                let byte_count = byte_count_field(data)?;
                if byte_count < 6 {
                    return Err(Error::decode(format!(
                        "comm event log too short: {} bytes",
                        byte_count
                    )));
                }
                Response::GetCommEventLog {
                    status: be_u16(data, 2),
                    event_count: be_u16(data, 4),
                    message_count: be_u16(data, 6),
                    events: data[8..].to_vec(),
                }
            }
            fc::WRITE_MULTIPLE_COILS => {
                expect_len(data, 5)?;
                Response::WriteMultipleCoils {
                    addr: be_u16(data, 1),
                    cnt: be_u16(data, 3),
                }
            }
            fc::WRITE_MULTIPLE_REGISTERS => {
                expect_len(data, 5)?;
                Response::WriteMultipleRegisters {
                    addr: be_u16(data, 1),
                    cnt: be_u16(data, 3),
                }
            }
            fc::REPORT_DEVICE_ID => {
                let byte_count = byte_count_field(data)?;
                if byte_count == 0 {
                    return Err(Error::decode("empty report device id response"));
                }
                Response::ReportDeviceId {
                    data: data[2..].to_vec(),
                }
            }
            fc::READ_FILE_RECORD => {
                byte_count_field(data)?;
                let mut body = &data[2..];
                let mut records = Vec::new();
                while !body.is_empty() {
                    if body.len() < 2 || body[1] != 6 {
                        return Err(Error::decode("invalid file record sub-response"));
                    }
                    let group_len = body[0] as usize;
                    if group_len < 1 || group_len % 2 == 0 || body.len() < 1 + group_len {
                        return Err(Error::decode("invalid file record sub-response length"));
                    }
                    records.push(words_from_be(&body[2..1 + group_len]));
                    body = &body[1 + group_len..];
                }
                Response::ReadFileRecord { records }
            }
            fc::WRITE_FILE_RECORD => {
                byte_count_field(data)?;
                Response::WriteFileRecord {
                    records: decode_file_records(&data[2..])?,
                }
            }
            fc::MASK_WRITE_REGISTER => {
                expect_len(data, 7)?;
                Response::MaskWriteRegister {
                    addr: be_u16(data, 1),
                    and_mask: be_u16(data, 3),
                    or_mask: be_u16(data, 5),
                }
            }
            fc::READ_WRITE_MULTIPLE_REGISTERS => {
                let byte_count = byte_count_field(data)?;
                if byte_count % 2 != 0 {
                    return Err(Error::decode(format!("odd register byte count: {}", byte_count)));
                }
                Response::ReadWriteMultipleRegisters {
                    words: words_from_be(&data[2..]),
                }
            }
            fc::READ_FIFO_QUEUE => {
                if data.len() < 5 {
                    return Err(Error::decode("fifo queue response too short"));
                }
                let byte_count = be_u16(data, 1) as usize;
                let fifo_count = be_u16(data, 3);
                if fifo_count > MAX_FIFO_WORDS {
                    return Err(Error::decode(format!("fifo count out of range: {}", fifo_count)));
                }
                if byte_count != 2 * (fifo_count as usize + 1) {
                    return Err(Error::decode(format!(
                        "fifo byte count {} does not match count {}",
                        byte_count, fifo_count
                    )));
                }
                expect_len(data, 3 + byte_count)?;
                Response::ReadFifoQueue {
                    words: words_from_be(&data[5..]),
                }
            }
            fc::ENCAPSULATED_INTERFACE => {
                if data.len() < 7 {
                    return Err(Error::decode("device information response too short"));
                }
                if data[1] != fc::MEI_READ_DEVICE_INFORMATION {
                    return Err(Error::decode(format!("unsupported MEI type: 0x{:02X}", data[1])));
                }
                let object_count = data[6] as usize;
                let mut objects = Vec::with_capacity(object_count);
                let mut pos = 7;
                for _ in 0..object_count {
                    if data.len() < pos + 2 {
                        return Err(Error::decode("truncated device information object"));
                    }
                    let len = data[pos + 1] as usize;
                    if data.len() < pos + 2 + len {
                        return Err(Error::decode("truncated device information object"));
                    }
                    objects.push(DeviceInfoObject {
                        id: data[pos],
                        value: data[pos + 2..pos + 2 + len].to_vec(),
                    });
                    pos += 2 + len;
                }
                expect_len(data, pos)?;
                Response::ReadDeviceInformation {
                    read_code: data[2],
                    conformity: data[3],
                    more_follows: data[4] == 0xFF,
                    next_object_id: data[5],
                    objects,
                }
            }
            x => {
                return Err(Error::decode(format!(
                    "unknown response function code: 0x{:02X}",
                    x
                )))
            }
        };
        Ok(ret)
    }
}

/// Read the byte-count field at offset 1 and check it against the payload.
fn byte_count_field(data: &[u8]) -> Result<usize> {
    if data.len() < 2 {
        return Err(Error::decode("PDU too short for byte count field"));
    }
    let byte_count = data[1] as usize;
    if data.len() != 2 + byte_count {
        return Err(Error::decode(format!(
            "byte count {} does not match payload of {} bytes",
            byte_count,
            data.len() - 2
        )));
    }
    Ok(byte_count)
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip_request(req: Request) {
        let encoded = req.encode().unwrap();
        let decoded = Request::decode(&encoded).unwrap();
        assert_eq!(req, decoded);
        assert_eq!(request_pdu_len(&encoded).unwrap(), Some(encoded.len()));
    }

    fn round_trip_response(resp: Response) {
        let encoded = resp.encode().unwrap();
        let decoded = Response::decode(&encoded).unwrap();
        assert_eq!(resp, decoded);
        assert_eq!(response_pdu_len(&encoded).unwrap(), Some(encoded.len()));
    }

    #[test]
    fn test_read_holding_request_wire_format() {
        let req = Request::ReadHoldingRegisters { addr: 1, cnt: 10 };
        assert_eq!(req.encode().unwrap(), vec![0x03, 0x00, 0x01, 0x00, 0x0A]);
    }

    #[test]
    fn test_read_coils_request_wire_format() {
        let req = Request::ReadCoils { addr: 1, cnt: 10 };
        assert_eq!(req.encode().unwrap(), vec![0x01, 0x00, 0x01, 0x00, 0x0A]);
    }

    #[test]
    fn test_bit_packing_lsb_first() {
        let bits = vec![
            true, false, true, true, false, false, false, false, true, false,
        ];
        assert_eq!(pack_bits(&bits), vec![0x0D, 0x01]);
        let resp = Response::ReadCoils { bits: bits.clone() };
        let encoded = resp.encode().unwrap();
        assert_eq!(encoded, vec![0x01, 0x02, 0x0D, 0x01]);
        // decoding yields all sixteen bits of the two payload bytes
        let decoded = Response::decode(&encoded).unwrap();
        match decoded {
            Response::ReadCoils { bits: all } => {
                assert_eq!(all.len(), 16);
                assert_eq!(&all[..10], &bits[..]);
                assert!(all[10..].iter().all(|x| !x));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_write_single_coil_wire_format() {
        let req = Request::WriteSingleCoil {
            addr: 0xAC,
            value: true,
        };
        assert_eq!(req.encode().unwrap(), vec![0x05, 0x00, 0xAC, 0xFF, 0x00]);
        assert!(Request::decode(&[0x05, 0x00, 0xAC, 0x12, 0x34]).is_err());
    }

    #[test]
    fn test_count_limits_rejected_at_encode() {
        assert!(Request::ReadCoils { addr: 0, cnt: 2001 }.encode().is_err());
        assert!(Request::ReadCoils { addr: 0, cnt: 0 }.encode().is_err());
        assert!(Request::ReadHoldingRegisters { addr: 0, cnt: 126 }
            .encode()
            .is_err());
        assert!(Request::WriteMultipleCoils {
            addr: 0,
            values: vec![true; 1969]
        }
        .encode()
        .is_err());
        assert!(Request::WriteMultipleRegisters {
            addr: 0,
            values: vec![0; 124]
        }
        .encode()
        .is_err());
        assert!(Request::ReadWriteMultipleRegisters {
            read_addr: 0,
            read_cnt: 122,
            write_addr: 0,
            values: vec![1]
        }
        .encode()
        .is_err());
    }

    #[test]
    fn test_byte_count_mismatch_rejected() {
        // declares 4 payload bytes but carries 3
        assert!(Response::decode(&[0x03, 0x04, 0x00, 0x01, 0x00]).is_err());
        // write multiple registers with a byte count that disagrees with cnt
        assert!(Request::decode(&[0x10, 0x00, 0x00, 0x00, 0x02, 0x02, 0x00, 0x01]).is_err());
    }

    #[test]
    fn test_exception_response() {
        let decoded = Response::decode(&[0x83, 0x02]).unwrap();
        assert_eq!(
            decoded,
            Response::Exception {
                function_code: 3,
                code: ExceptionCode::IllegalDataAddress
            }
        );
        assert_eq!(decoded.encode().unwrap(), vec![0x83, 0x02]);
        assert_eq!(response_pdu_len(&[0x83]).unwrap(), Some(2));
    }

    #[test]
    fn test_request_round_trips() {
        round_trip_request(Request::ReadCoils { addr: 7, cnt: 17 });
        round_trip_request(Request::ReadDiscreteInputs { addr: 0, cnt: 2000 });
        round_trip_request(Request::ReadHoldingRegisters { addr: 0x6B, cnt: 3 });
        round_trip_request(Request::ReadInputRegisters { addr: 8, cnt: 125 });
        round_trip_request(Request::WriteSingleCoil {
            addr: 0xFFFF,
            value: false,
        });
        round_trip_request(Request::WriteSingleRegister {
            addr: 1,
            value: 0xABCD,
        });
        round_trip_request(Request::ReadExceptionStatus);
        round_trip_request(Request::Diagnostics {
            sub_function: 0,
            data: 0xA537,
        });
        round_trip_request(Request::GetCommEventCounter);
        round_trip_request(Request::GetCommEventLog);
        round_trip_request(Request::WriteMultipleCoils {
            addr: 19,
            values: vec![true, false, true, true, false, false, true, true, true, false],
        });
        round_trip_request(Request::WriteMultipleRegisters {
            addr: 1,
            values: vec![0x000A, 0x0102],
        });
        round_trip_request(Request::ReportDeviceId);
        round_trip_request(Request::ReadFileRecord {
            records: vec![
                FileRecordRef {
                    file_number: 4,
                    record_number: 1,
                    record_length: 2,
                },
                FileRecordRef {
                    file_number: 3,
                    record_number: 9,
                    record_length: 2,
                },
            ],
        });
        round_trip_request(Request::WriteFileRecord {
            records: vec![FileRecord {
                file_number: 4,
                record_number: 7,
                words: vec![0x06AF, 0x04BE, 0x100D],
            }],
        });
        round_trip_request(Request::MaskWriteRegister {
            addr: 4,
            and_mask: 0x00F2,
            or_mask: 0x0025,
        });
        round_trip_request(Request::ReadWriteMultipleRegisters {
            read_addr: 3,
            read_cnt: 6,
            write_addr: 14,
            values: vec![0x00FF, 0x00FF, 0x00FF],
        });
        round_trip_request(Request::ReadFifoQueue { addr: 0x04DE });
        round_trip_request(Request::ReadDeviceInformation {
            read_code: 1,
            object_id: 0,
        });
    }

    #[test]
    fn test_response_round_trips() {
        round_trip_response(Response::ReadCoils {
            bits: vec![true; 8],
        });
        round_trip_response(Response::ReadHoldingRegisters {
            words: vec![0x00B5, 0x122F, 0x3721, 0x0003],
        });
        round_trip_response(Response::WriteSingleCoil {
            addr: 0xAC,
            value: true,
        });
        round_trip_response(Response::WriteSingleRegister { addr: 1, value: 3 });
        round_trip_response(Response::ReadExceptionStatus { status: 0x6D });
        round_trip_response(Response::Diagnostics {
            sub_function: 0,
            data: 0xA537,
        });
        round_trip_response(Response::GetCommEventCounter {
            status: 0,
            event_count: 264,
        });
        round_trip_response(Response::GetCommEventLog {
            status: 0,
            event_count: 264,
            message_count: 289,
            events: vec![0x20, 0x00],
        });
        round_trip_response(Response::WriteMultipleCoils { addr: 19, cnt: 10 });
        round_trip_response(Response::WriteMultipleRegisters { addr: 1, cnt: 2 });
        round_trip_response(Response::ReportDeviceId {
            data: vec![0x11, 0xFF, b'm', b'b'],
        });
        round_trip_response(Response::ReadFileRecord {
            records: vec![vec![0x0DFE, 0x0020], vec![0x33CD, 0x0040]],
        });
        round_trip_response(Response::WriteFileRecord {
            records: vec![FileRecord {
                file_number: 4,
                record_number: 7,
                words: vec![0x06AF],
            }],
        });
        round_trip_response(Response::MaskWriteRegister {
            addr: 4,
            and_mask: 0x00F2,
            or_mask: 0x0025,
        });
        round_trip_response(Response::ReadWriteMultipleRegisters {
            words: vec![0x00FE, 0x0ACD],
        });
        round_trip_response(Response::ReadFifoQueue {
            words: vec![0x01B8, 0x1284],
        });
        round_trip_response(Response::ReadDeviceInformation {
            read_code: 1,
            conformity: 0x81,
            more_follows: false,
            next_object_id: 0,
            objects: vec![
                DeviceInfoObject {
                    id: 0,
                    value: b"Company identification".to_vec(),
                },
                DeviceInfoObject {
                    id: 1,
                    value: b"Product code".to_vec(),
                },
            ],
        });
    }

    #[test]
    fn test_device_information_len_incremental() {
        let resp = Response::ReadDeviceInformation {
            read_code: 1,
            conformity: 0x81,
            more_follows: true,
            next_object_id: 3,
            objects: vec![DeviceInfoObject {
                id: 0,
                value: b"vendor".to_vec(),
            }],
        };
        let encoded = resp.encode().unwrap();
        for cut in 0..encoded.len() {
            let got = response_pdu_len(&encoded[..cut]).unwrap();
            if cut < 9 {
                assert_eq!(got, None, "cut at {}", cut);
            } else {
                assert_eq!(got, Some(encoded.len()), "cut at {}", cut);
            }
        }
    }

    #[test]
    fn test_unknown_function_code() {
        assert!(Request::decode(&[0x64, 0x01]).is_err());
        assert!(request_pdu_len(&[0x64]).is_err());
        assert!(response_pdu_len(&[0x64]).is_err());
    }
}
