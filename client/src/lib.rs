//! Typed Modbus client API.
//!
//! [`ModbusClient`] wraps a [`Connection`] and offers one method per Modbus
//! operation. Every method validates its arguments before anything touches
//! the wire, builds the request PDU, drives it through the transaction
//! manager and checks that the answer has the right shape. Exception
//! responses come back as [`Error::Exception`].

use anyhow::anyhow;

use mbsrv::transaction::Connection;
use mbsrv_protocol::{
    diagnostic_codes as diag, DeviceInfoObject, Error, FileRecord, FileRecordRef, Request,
    Response, Result,
};

/// A client bound to one device id on a connection. Cloning is cheap and
/// shares the underlying connection.
#[derive(Clone)]
pub struct ModbusClient {
    conn: Connection,
    device_id: u8,
}

/// Comm event log snapshot returned by [`ModbusClient::get_comm_event_log`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommEventLog {
    pub status: u16,
    pub event_count: u16,
    pub message_count: u16,
    pub events: Vec<u8>,
}

/// One page of device identification objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInformation {
    pub conformity: u8,
    pub more_follows: bool,
    pub next_object_id: u8,
    pub objects: Vec<DeviceInfoObject>,
}

fn unexpected(response: &Response) -> Error {
    Error::invalid_frame(format!(
        "unexpected response variant for function code {}",
        response.function_code()
    ))
}

impl ModbusClient {
    /// Bind to the connection's default device id.
    pub fn new(conn: Connection) -> Self {
        let device_id = conn.config().default_device_id;
        Self { conn, device_id }
    }

    pub fn with_device_id(conn: Connection, device_id: u8) -> Self {
        Self { conn, device_id }
    }

    pub fn set_device_id(&mut self, device_id: u8) {
        self.device_id = device_id;
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    async fn request(&self, request: Request) -> Result<Response> {
        let response = self.conn.transact(self.device_id, request).await?;
        response.into_result()
    }

    pub async fn read_coils(&self, addr: u16, cnt: u16) -> Result<Vec<bool>> {
        match self.request(Request::ReadCoils { addr, cnt }).await? {
            Response::ReadCoils { mut bits } if bits.len() >= cnt as usize => {
                bits.truncate(cnt as usize);
                Ok(bits)
            }
            other => Err(unexpected(&other)),
        }
    }

    pub async fn read_single_coil(&self, addr: u16) -> Result<bool> {
        Ok(self.read_coils(addr, 1).await?[0])
    }

    pub async fn read_discrete_inputs(&self, addr: u16, cnt: u16) -> Result<Vec<bool>> {
        match self.request(Request::ReadDiscreteInputs { addr, cnt }).await? {
            Response::ReadDiscreteInputs { mut bits } if bits.len() >= cnt as usize => {
                bits.truncate(cnt as usize);
                Ok(bits)
            }
            other => Err(unexpected(&other)),
        }
    }

    pub async fn read_single_discrete_input(&self, addr: u16) -> Result<bool> {
        Ok(self.read_discrete_inputs(addr, 1).await?[0])
    }

    pub async fn read_holding_registers(&self, addr: u16, cnt: u16) -> Result<Vec<u16>> {
        match self.request(Request::ReadHoldingRegisters { addr, cnt }).await? {
            Response::ReadHoldingRegisters { words } if words.len() == cnt as usize => Ok(words),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn read_single_holding_register(&self, addr: u16) -> Result<u16> {
        Ok(self.read_holding_registers(addr, 1).await?[0])
    }

    pub async fn read_input_registers(&self, addr: u16, cnt: u16) -> Result<Vec<u16>> {
        match self.request(Request::ReadInputRegisters { addr, cnt }).await? {
            Response::ReadInputRegisters { words } if words.len() == cnt as usize => Ok(words),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn read_single_input_register(&self, addr: u16) -> Result<u16> {
        Ok(self.read_input_registers(addr, 1).await?[0])
    }

    pub async fn write_single_coil(&self, addr: u16, value: bool) -> Result<()> {
        match self.request(Request::WriteSingleCoil { addr, value }).await? {
            Response::WriteSingleCoil {
                addr: echo_addr,
                value: echo_value,
            } if echo_addr == addr && echo_value == value => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn write_single_register(&self, addr: u16, value: u16) -> Result<()> {
        match self
            .request(Request::WriteSingleRegister { addr, value })
            .await?
        {
            Response::WriteSingleRegister {
                addr: echo_addr,
                value: echo_value,
            } if echo_addr == addr && echo_value == value => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn write_multiple_coils(&self, addr: u16, values: Vec<bool>) -> Result<()> {
        let cnt = values.len() as u16;
        match self
            .request(Request::WriteMultipleCoils { addr, values })
            .await?
        {
            Response::WriteMultipleCoils {
                addr: echo_addr,
                cnt: echo_cnt,
            } if echo_addr == addr && echo_cnt == cnt => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn write_multiple_registers(&self, addr: u16, values: Vec<u16>) -> Result<()> {
        let cnt = values.len() as u16;
        match self
            .request(Request::WriteMultipleRegisters { addr, values })
            .await?
        {
            Response::WriteMultipleRegisters {
                addr: echo_addr,
                cnt: echo_cnt,
            } if echo_addr == addr && echo_cnt == cnt => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn read_exception_status(&self) -> Result<u8> {
        match self.request(Request::ReadExceptionStatus).await? {
            Response::ReadExceptionStatus { status } => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    /// Raw diagnostics call, returning the response data word.
    pub async fn diagnostics(&self, sub_function: u16, data: u16) -> Result<u16> {
        match self.request(Request::Diagnostics { sub_function, data }).await? {
            Response::Diagnostics {
                sub_function: echo_sub,
                data,
            } if echo_sub == sub_function => Ok(data),
            other => Err(unexpected(&other)),
        }
    }

    /// Loopback test: the device must echo the data word.
    pub async fn return_query_data(&self, data: u16) -> Result<()> {
        let echoed = self.diagnostics(diag::RETURN_QUERY_DATA, data).await?;
        if echoed != data {
            return Err(Error::invalid_frame(format!(
                "loopback returned 0x{:04X} instead of 0x{:04X}",
                echoed, data
            )));
        }
        Ok(())
    }

    /// Leave listen-only mode and optionally clear the peer's event log.
    pub async fn restart_communications(&self, clear_log: bool) -> Result<()> {
        let data = if clear_log { 0xFF00 } else { 0x0000 };
        self.diagnostics(diag::RESTART_COMMUNICATIONS, data).await?;
        Ok(())
    }

    pub async fn get_comm_event_counter(&self) -> Result<(u16, u16)> {
        match self.request(Request::GetCommEventCounter).await? {
            Response::GetCommEventCounter {
                status,
                event_count,
            } => Ok((status, event_count)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_comm_event_log(&self) -> Result<CommEventLog> {
        match self.request(Request::GetCommEventLog).await? {
            Response::GetCommEventLog {
                status,
                event_count,
                message_count,
                events,
            } => Ok(CommEventLog {
                status,
                event_count,
                message_count,
                events,
            }),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn report_device_id(&self) -> Result<Vec<u8>> {
        match self.request(Request::ReportDeviceId).await? {
            Response::ReportDeviceId { data } => Ok(data),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn read_file_record(&self, records: Vec<FileRecordRef>) -> Result<Vec<Vec<u16>>> {
        let expected = records.len();
        match self.request(Request::ReadFileRecord { records }).await? {
            Response::ReadFileRecord { records } if records.len() == expected => Ok(records),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn write_file_record(&self, records: Vec<FileRecord>) -> Result<()> {
        match self.request(Request::WriteFileRecord { records }).await? {
            Response::WriteFileRecord { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn mask_write_register(&self, addr: u16, and_mask: u16, or_mask: u16) -> Result<()> {
        match self
            .request(Request::MaskWriteRegister {
                addr,
                and_mask,
                or_mask,
            })
            .await?
        {
            Response::MaskWriteRegister {
                addr: echo_addr, ..
            } if echo_addr == addr => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn read_write_multiple_registers(
        &self,
        read_addr: u16,
        read_cnt: u16,
        write_addr: u16,
        values: Vec<u16>,
    ) -> Result<Vec<u16>> {
        match self
            .request(Request::ReadWriteMultipleRegisters {
                read_addr,
                read_cnt,
                write_addr,
                values,
            })
            .await?
        {
            Response::ReadWriteMultipleRegisters { words } if words.len() == read_cnt as usize => {
                Ok(words)
            }
            other => Err(unexpected(&other)),
        }
    }

    pub async fn read_fifo_queue(&self, addr: u16) -> Result<Vec<u16>> {
        match self.request(Request::ReadFifoQueue { addr }).await? {
            Response::ReadFifoQueue { words } => Ok(words),
            other => Err(unexpected(&other)),
        }
    }

    /// One page of identification objects starting at `object_id`.
    pub async fn read_device_information(
        &self,
        read_code: u8,
        object_id: u8,
    ) -> Result<DeviceInformation> {
        match self
            .request(Request::ReadDeviceInformation {
                read_code,
                object_id,
            })
            .await?
        {
            Response::ReadDeviceInformation {
                conformity,
                more_follows,
                next_object_id,
                objects,
                ..
            } => Ok(DeviceInformation {
                conformity,
                more_follows,
                next_object_id,
                objects,
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Follow the "more follows" continuation until every object of the
    /// stream category is collected.
    pub async fn read_device_information_all(
        &self,
        read_code: u8,
    ) -> Result<Vec<DeviceInfoObject>> {
        let mut objects = Vec::new();
        let mut object_id = 0;
        loop {
            let page = self.read_device_information(read_code, object_id).await?;
            objects.extend(page.objects);
            if !page.more_follows {
                return Ok(objects);
            }
            if page.next_object_id <= object_id {
                return Err(Error::invalid_frame(
                    "device information continuation does not advance",
                ));
            }
            object_id = page.next_object_id;
        }
    }

    /// Send a registered custom function code and return the raw response
    /// body.
    pub async fn custom(&self, function_code: u8, data: Vec<u8>) -> Result<Vec<u8>> {
        match self
            .request(Request::Custom {
                function_code,
                data,
            })
            .await?
        {
            Response::Custom { data, .. } => Ok(data),
            other => Err(unexpected(&other)),
        }
    }

    /// Broadcast a write to every device on the line; resolves as soon as
    /// the frame is sent. Reads are rejected.
    pub async fn broadcast(&self, request: Request) -> Result<()> {
        if request.is_read() {
            return Err(Error::invalid_request(anyhow!(
                "cannot broadcast a read request"
            )));
        }
        self.conn.broadcast(request).await
    }
}
