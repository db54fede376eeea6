//! The transaction manager: one task per connection owning the transport,
//! the framer and the table of outstanding transactions.
//!
//! [`Connection`] is the cheap-to-clone handle; requests travel to the task
//! over a command channel and come back through oneshot answers. On a Socket
//! framing many transactions are in flight at once, keyed by transaction id.
//! On serial framings nothing on the wire correlates responses to requests,
//! so the task admits a single outstanding transaction and queues the rest.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use mbsrv_protocol::{
    Error, FramerKind, Request, Response, Result, BROADCAST_DEVICE_ID, DEFAULT_DEVICE_ID,
};

use crate::framer::{make_framer, Adu, DeviceFilter, Direction, FrameEvent, Framer, Pdu};
use crate::registry::FunctionRegistry;
use crate::serial::SerialParams;
use crate::transport::Transport;

const RECV_CHUNK: usize = 4096;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_RETRIES: u8 = 3;

const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub framer: FramerKind,
    /// Per-request deadline, measured from the moment the request is sent.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Resend budget for timeouts and connection losses. Exception responses
    /// and invalid frames are never retried.
    pub retries: u8,
    pub default_device_id: u8,
    pub reconnect_delay: Duration,
    /// Timing source for the RTU inter-frame silence.
    pub serial: Option<SerialParams>,
}

impl ClientConfig {
    pub fn new(framer: FramerKind) -> Self {
        Self {
            framer,
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            default_device_id: DEFAULT_DEVICE_ID,
            reconnect_delay: MIN_RECONNECT_DELAY,
            serial: None,
        }
    }

    fn clamped_reconnect_delay(&self) -> Duration {
        self.reconnect_delay
            .max(MIN_RECONNECT_DELAY)
            .min(MAX_RECONNECT_DELAY)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(FramerKind::Socket)
    }
}

enum Command {
    Transact {
        device_id: u8,
        request: Request,
        answer: oneshot::Sender<Result<Response>>,
    },
    Broadcast {
        request: Request,
        answer: oneshot::Sender<Result<()>>,
    },
    Disconnect,
}

struct Pending {
    device_id: u8,
    function_code: u8,
    deadline: Instant,
    answer: oneshot::Sender<Result<Response>>,
}

/// Handle to a connection task. Cloning shares the same connection.
pub struct Connection {
    tx: mpsc::UnboundedSender<Command>,
    config: ClientConfig,
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            config: self.config.clone(),
        }
    }
}

impl Connection {
    pub fn new<T: Transport + 'static>(transport: T, config: ClientConfig) -> Self {
        Self::with_registry(transport, config, None)
    }

    pub fn with_registry<T: Transport + 'static>(
        transport: T,
        config: ClientConfig,
        registry: Option<std::sync::Arc<FunctionRegistry>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let framer = make_framer(config.framer, Direction::Response, registry);
        let silent_interval = match config.framer {
            FramerKind::Rtu => Some(
                config
                    .serial
                    .clone()
                    .unwrap_or_default()
                    .silent_interval(),
            ),
            _ => None,
        };
        let task = ConnectionTask {
            transport,
            framer,
            pending: HashMap::new(),
            queue: VecDeque::new(),
            next_transaction_id: 0,
            single_outstanding: config.framer.is_single_outstanding(),
            connected: false,
            last_activity: Instant::now(),
            silent_interval,
            config: config.clone(),
        };
        tokio::spawn(task.run(rx));
        Self { tx, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send a request and wait for the matching response, retrying timeouts
    /// and connection losses up to the configured budget. Exception responses
    /// are returned as `Ok(Response::Exception { .. })`.
    pub async fn transact(&self, device_id: u8, request: Request) -> Result<Response> {
        if device_id == BROADCAST_DEVICE_ID {
            return Err(Error::invalid_request(anyhow::anyhow!(
                "device id 0 is broadcast; use broadcast()"
            )));
        }
        request.validate()?;
        let mut attempts_left = u32::from(self.config.retries) + 1;
        loop {
            attempts_left -= 1;
            let (answer, rx) = oneshot::channel();
            self.tx
                .send(Command::Transact {
                    device_id,
                    request: request.clone(),
                    answer,
                })
                .map_err(|_| Error::ConnectionLost)?;
            let result = match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectionLost),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(err) if attempts_left > 0 && err.should_retry() => {
                    warn!(
                        "request to device {} failed ({}), {} attempts left",
                        device_id, err, attempts_left
                    );
                    if err.is_disconnect() {
                        tokio::time::sleep(self.config.clamped_reconnect_delay()).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Send a request to every device on the line. Resolves as soon as the
    /// frame is on the wire; nothing ever answers a broadcast. Reads are
    /// rejected because they cannot work without a response.
    pub async fn broadcast(&self, request: Request) -> Result<()> {
        if request.is_read() {
            return Err(Error::invalid_request(anyhow::anyhow!(
                "cannot broadcast a read request"
            )));
        }
        request.validate()?;
        let mut attempts_left = u32::from(self.config.retries) + 1;
        loop {
            attempts_left -= 1;
            let (answer, rx) = oneshot::channel();
            self.tx
                .send(Command::Broadcast {
                    request: request.clone(),
                    answer,
                })
                .map_err(|_| Error::ConnectionLost)?;
            let result = match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectionLost),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) if attempts_left > 0 && err.should_retry() => {
                    warn!("broadcast failed ({}), {} attempts left", err, attempts_left);
                    if err.is_disconnect() {
                        tokio::time::sleep(self.config.clamped_reconnect_delay()).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drop the connection. Outstanding transactions fail with
    /// `ConnectionLost`; the next request reconnects.
    pub fn disconnect(&self) {
        let _ = self.tx.send(Command::Disconnect);
    }
}

struct ConnectionTask<T: Transport> {
    transport: T,
    framer: Box<dyn Framer>,
    config: ClientConfig,
    pending: HashMap<u16, Pending>,
    queue: VecDeque<Command>,
    next_transaction_id: u16,
    single_outstanding: bool,
    connected: bool,
    last_activity: Instant,
    silent_interval: Option<Duration>,
}

enum Event {
    Cmd(Option<Command>),
    Data(Result<Vec<u8>>),
    DeadlineExpired,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

impl<T: Transport> ConnectionTask<T> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.pending.values().map(|x| x.deadline).min();
            let event = if self.connected {
                tokio::select! {
                    cmd = rx.recv() => Event::Cmd(cmd),
                    data = self.transport.recv(RECV_CHUNK) => Event::Data(data),
                    _ = sleep_until_opt(deadline) => Event::DeadlineExpired,
                }
            } else {
                tokio::select! {
                    cmd = rx.recv() => Event::Cmd(cmd),
                    _ = sleep_until_opt(deadline) => Event::DeadlineExpired,
                }
            };
            match event {
                Event::Cmd(None) => {
                    self.connection_lost("handle dropped").await;
                    break;
                }
                Event::Cmd(Some(cmd)) => self.handle_command(cmd).await,
                Event::Data(Ok(data)) => {
                    if data.is_empty() {
                        self.connection_lost("stream closed by peer").await;
                    } else {
                        self.handle_bytes(&data).await;
                    }
                }
                Event::Data(Err(err)) => {
                    let reason = err.to_string();
                    self.connection_lost(&reason).await;
                }
                Event::DeadlineExpired => self.expire_deadlines().await,
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Disconnect => {
                self.connection_lost("disconnect requested").await;
            }
            cmd if self.single_outstanding && !self.pending.is_empty() => {
                self.queue.push_back(cmd);
            }
            Command::Transact {
                device_id,
                request,
                answer,
            } => {
                self.start_transaction(device_id, request, answer).await;
            }
            Command::Broadcast { request, answer } => {
                let result = self.send_broadcast(&request).await;
                let _ = answer.send(result);
            }
        }
    }

    async fn start_transaction(
        &mut self,
        device_id: u8,
        request: Request,
        answer: oneshot::Sender<Result<Response>>,
    ) {
        let transaction_id = if self.config.framer == FramerKind::Socket {
            self.alloc_transaction_id()
        } else {
            0
        };
        match self.send_request(device_id, transaction_id, &request).await {
            Ok(()) => {
                let pending = Pending {
                    device_id,
                    function_code: request.function_code(),
                    deadline: Instant::now() + self.config.timeout,
                    answer,
                };
                self.pending.insert(transaction_id, pending);
            }
            Err(err) => {
                let disconnect = err.is_disconnect();
                let reason = err.to_string();
                let _ = answer.send(Err(err));
                if disconnect {
                    self.connection_lost(&reason).await;
                }
            }
        }
    }

    async fn send_broadcast(&mut self, request: &Request) -> Result<()> {
        let transaction_id = if self.config.framer == FramerKind::Socket {
            self.alloc_transaction_id()
        } else {
            0
        };
        self.send_request(BROADCAST_DEVICE_ID, transaction_id, request)
            .await
    }

    async fn send_request(
        &mut self,
        device_id: u8,
        transaction_id: u16,
        request: &Request,
    ) -> Result<()> {
        self.ensure_connected().await?;
        let pdu = request.encode()?;
        let bytes = self.framer.build(&Adu {
            transaction_id,
            device_id,
            pdu,
        })?;
        self.wait_silent_interval().await;
        self.transport.send(&bytes).await?;
        self.last_activity = Instant::now();
        Ok(())
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.connected && self.transport.is_connected() {
            return Ok(());
        }
        self.connected = false;
        match tokio::time::timeout(self.config.connect_timeout, self.transport.connect()).await {
            Ok(Ok(())) => {
                info!("connected");
                self.connected = true;
                self.framer.reset();
                self.transport.on_connected();
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// RTU requires 3.5 character times of silence between the last line
    /// activity and the next transmitted frame.
    async fn wait_silent_interval(&mut self) {
        if let Some(interval) = self.silent_interval {
            let ready = self.last_activity + interval;
            if ready > Instant::now() {
                tokio::time::sleep_until(ready).await;
            }
        }
    }

    fn alloc_transaction_id(&mut self) -> u16 {
        // monotonic, wrapping; skip ids still in flight
        loop {
            let id = self.next_transaction_id;
            self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    async fn handle_bytes(&mut self, data: &[u8]) {
        self.last_activity = Instant::now();
        let filter = DeviceFilter::only(self.pending.values().map(|x| x.device_id));
        let mut events = Vec::new();
        self.framer.consume(data, &filter, &mut |event| events.push(event));
        for event in events {
            self.handle_frame_event(event);
        }
        self.pump_queue().await;
    }

    fn handle_frame_event(&mut self, event: FrameEvent) {
        match event {
            FrameEvent::Frame(frame) => {
                let response = match frame.pdu {
                    Pdu::Response(response) => response,
                    Pdu::Request(_) => return,
                };
                self.complete(frame.transaction_id, frame.device_id, Ok(response));
            }
            FrameEvent::DecodeFailure {
                device_id,
                transaction_id,
                error,
                ..
            } => {
                self.complete(
                    transaction_id,
                    device_id,
                    Err(Error::InvalidFrame(error.to_string())),
                );
            }
        }
    }

    fn complete(&mut self, transaction_id: u16, device_id: u8, result: Result<Response>) {
        let pending = match self.pending.remove(&transaction_id) {
            Some(pending) => pending,
            None => {
                debug!("stray response with transaction id {}", transaction_id);
                return;
            }
        };
        let result = result.and_then(|response| {
            if pending.device_id != device_id {
                return Err(Error::invalid_frame(format!(
                    "response from device {} to a request for device {}",
                    device_id, pending.device_id
                )));
            }
            let expected = pending.function_code;
            match &response {
                Response::Exception { function_code, .. } if *function_code != expected => Err(
                    Error::invalid_frame(format!(
                        "exception for function code {} does not match request {}",
                        function_code, expected
                    )),
                ),
                Response::Exception { .. } => Ok(response),
                _ if response.function_code() != expected => Err(Error::invalid_frame(format!(
                    "response function code {} does not match request {}",
                    response.function_code(),
                    expected
                ))),
                _ => Ok(response),
            }
        });
        let _ = pending.answer.send(result);
    }

    async fn expire_deadlines(&mut self) {
        // waiters that were cancelled free their transaction records
        self.pending.retain(|_, x| !x.answer.is_closed());
        let now = Instant::now();
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, x)| x.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for transaction_id in expired {
            if let Some(pending) = self.pending.remove(&transaction_id) {
                warn!(
                    "transaction {} to device {} timed out",
                    transaction_id, pending.device_id
                );
                let _ = pending.answer.send(Err(Error::Timeout));
            }
        }
        self.pump_queue().await;
    }

    /// Start queued serial transactions once the line is free. Transactions
    /// whose caller has gone away are skipped without touching the wire.
    async fn pump_queue(&mut self) {
        while self.pending.is_empty() {
            let cmd = match self.queue.pop_front() {
                Some(cmd) => cmd,
                None => return,
            };
            match cmd {
                Command::Transact {
                    device_id,
                    request,
                    answer,
                } => {
                    if answer.is_closed() {
                        continue;
                    }
                    self.start_transaction(device_id, request, answer).await;
                }
                Command::Broadcast { request, answer } => {
                    if answer.is_closed() {
                        continue;
                    }
                    let result = self.send_broadcast(&request).await;
                    let _ = answer.send(result);
                }
                Command::Disconnect => {
                    self.connection_lost("disconnect requested").await;
                }
            }
        }
    }

    async fn connection_lost(&mut self, reason: &str) {
        if self.connected {
            warn!("connection lost: {}", reason);
            self.transport.on_disconnected();
        }
        self.connected = false;
        self.transport.close().await;
        self.framer.reset();
        for (_, pending) in self.pending.drain() {
            let _ = pending.answer.send(Err(Error::ConnectionLost));
        }
        for cmd in self.queue.drain(..) {
            match cmd {
                Command::Transact { answer, .. } => {
                    let _ = answer.send(Err(Error::ConnectionLost));
                }
                Command::Broadcast { answer, .. } => {
                    let _ = answer.send(Err(Error::ConnectionLost));
                }
                Command::Disconnect => {}
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::framer::{DecodedFrame, SocketFramer};
    use crate::transport::StreamTransport;
    use mbsrv_protocol::ExceptionCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn test_config(framer: FramerKind) -> ClientConfig {
        let mut config = ClientConfig::new(framer);
        config.timeout = Duration::from_millis(200);
        config.connect_timeout = Duration::from_millis(200);
        config.retries = 0;
        config.reconnect_delay = Duration::from_millis(100);
        config
    }

    fn connect(config: ClientConfig) -> (Connection, DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        let conn = Connection::new(StreamTransport::new(client), config);
        (conn, server)
    }

    fn build_rtu_response(device_id: u8, response: &Response) -> Vec<u8> {
        let mut framer = crate::framer::RtuFramer::new(Direction::Request, None);
        framer
            .build(&Adu {
                transaction_id: 0,
                device_id,
                pdu: response.encode().unwrap(),
            })
            .unwrap()
    }

    /// Server side of a socket connection under test: a persistent framer
    /// plus a queue of already-parsed requests.
    struct TestServer {
        stream: DuplexStream,
        framer: SocketFramer,
        inbox: VecDeque<DecodedFrame>,
    }

    impl TestServer {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                framer: SocketFramer::new(Direction::Request, None),
                inbox: VecDeque::new(),
            }
        }

        async fn next_request(&mut self) -> DecodedFrame {
            loop {
                if let Some(frame) = self.inbox.pop_front() {
                    return frame;
                }
                let mut buf = [0_u8; 256];
                let n = self.stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "connection closed while waiting for a request");
                let inbox = &mut self.inbox;
                self.framer
                    .consume(&buf[..n], &DeviceFilter::any(), &mut |event| {
                        if let FrameEvent::Frame(frame) = event {
                            inbox.push_back(frame);
                        }
                    });
            }
        }

        async fn respond(&mut self, transaction_id: u16, device_id: u8, response: &Response) {
            let bytes = self
                .framer
                .build(&Adu {
                    transaction_id,
                    device_id,
                    pdu: response.encode().unwrap(),
                })
                .unwrap();
            self.stream.write_all(&bytes).await.unwrap();
        }

        /// Assert that nothing further arrives within `window`.
        async fn expect_quiet(&mut self, window: Duration) {
            let mut buf = [0_u8; 64];
            match tokio::time::timeout(window, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) | Err(_) => {}
                other => panic!("unexpected extra traffic: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let (conn, server) = connect(test_config(FramerKind::Socket));
        let task = tokio::spawn(async move {
            let mut server = TestServer::new(server);
            let frame = server.next_request().await;
            assert_eq!(frame.device_id, 1);
            server
                .respond(
                    frame.transaction_id,
                    1,
                    &Response::ReadHoldingRegisters {
                        words: vec![7, 8, 9],
                    },
                )
                .await;
        });
        let response = conn
            .transact(1, Request::ReadHoldingRegisters { addr: 0, cnt: 3 })
            .await
            .unwrap();
        assert_eq!(
            response,
            Response::ReadHoldingRegisters {
                words: vec![7, 8, 9]
            }
        );
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_socket_out_of_order_responses() {
        let (conn, server) = connect(test_config(FramerKind::Socket));
        let task = tokio::spawn(async move {
            let mut server = TestServer::new(server);
            let first = server.next_request().await;
            let second = server.next_request().await;
            assert_ne!(first.transaction_id, second.transaction_id);
            // answer in reverse order
            server
                .respond(
                    second.transaction_id,
                    1,
                    &Response::ReadHoldingRegisters { words: vec![2] },
                )
                .await;
            server
                .respond(
                    first.transaction_id,
                    1,
                    &Response::ReadHoldingRegisters { words: vec![1] },
                )
                .await;
        });
        let first = conn.transact(1, Request::ReadHoldingRegisters { addr: 1, cnt: 1 });
        let second = conn.transact(1, Request::ReadHoldingRegisters { addr: 2, cnt: 1 });
        let (first, second) = tokio::join!(first, second);
        assert_eq!(
            first.unwrap(),
            Response::ReadHoldingRegisters { words: vec![1] }
        );
        assert_eq!(
            second.unwrap(),
            Response::ReadHoldingRegisters { words: vec![2] }
        );
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_exception_response_surfaces_and_is_not_retried() {
        let mut config = test_config(FramerKind::Socket);
        config.retries = 3;
        let (conn, server) = connect(config);
        let task = tokio::spawn(async move {
            let mut server = TestServer::new(server);
            let frame = server.next_request().await;
            server
                .respond(
                    frame.transaction_id,
                    1,
                    &Response::exception(3, ExceptionCode::IllegalDataAddress),
                )
                .await;
            // a retry would show up as a second request
            server.expect_quiet(Duration::from_millis(300)).await;
        });
        let response = conn
            .transact(1, Request::ReadHoldingRegisters { addr: 9999, cnt: 1 })
            .await
            .unwrap();
        assert!(response.is_exception());
        assert!(matches!(
            response.into_result(),
            Err(Error::Exception(ExceptionCode::IllegalDataAddress))
        ));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_then_retry_succeeds() {
        let mut config = test_config(FramerKind::Socket);
        config.retries = 1;
        config.timeout = Duration::from_millis(100);
        let (conn, server) = connect(config);
        let task = tokio::spawn(async move {
            let mut server = TestServer::new(server);
            // ignore the first attempt, answer the retry
            let _first = server.next_request().await;
            let second = server.next_request().await;
            server
                .respond(
                    second.transaction_id,
                    1,
                    &Response::ReadHoldingRegisters { words: vec![5] },
                )
                .await;
        });
        let response = conn
            .transact(1, Request::ReadHoldingRegisters { addr: 0, cnt: 1 })
            .await
            .unwrap();
        assert_eq!(response, Response::ReadHoldingRegisters { words: vec![5] });
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_without_retries() {
        let (conn, _server) = connect(test_config(FramerKind::Socket));
        let err = conn
            .transact(1, Request::ReadHoldingRegisters { addr: 0, cnt: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn test_connection_lost_fails_outstanding() {
        let (conn, server) = connect(test_config(FramerKind::Socket));
        let pending = conn.transact(1, Request::ReadHoldingRegisters { addr: 0, cnt: 1 });
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(server);
        });
        let err = pending.await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost));
    }

    #[tokio::test]
    async fn test_serial_single_outstanding() {
        let (conn, mut server) = connect(test_config(FramerKind::RtuOverTcp));
        let conn2 = conn.clone();
        let first = tokio::spawn(async move {
            conn.transact(1, Request::ReadHoldingRegisters { addr: 0, cnt: 1 })
                .await
        });
        let second = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            conn2
                .transact(1, Request::ReadHoldingRegisters { addr: 1, cnt: 1 })
                .await
        });
        // first request arrives
        let mut buf = [0_u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(n, 8);
        // the second send must stay queued while the first is outstanding
        let waited =
            tokio::time::timeout(Duration::from_millis(80), server.read(&mut buf)).await;
        assert!(waited.is_err(), "second request sent while first pending");
        // answer the first; the second follows
        let response = Response::ReadHoldingRegisters { words: vec![1] };
        let bytes = build_rtu_response(1, &response);
        server.write_all(&bytes).await.unwrap();
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(n, 8);
        let response = Response::ReadHoldingRegisters { words: vec![2] };
        let bytes = build_rtu_response(1, &response);
        server.write_all(&bytes).await.unwrap();
        assert_eq!(
            first.await.unwrap().unwrap(),
            Response::ReadHoldingRegisters { words: vec![1] }
        );
        assert_eq!(
            second.await.unwrap().unwrap(),
            Response::ReadHoldingRegisters { words: vec![2] }
        );
    }

    #[tokio::test]
    async fn test_broadcast_is_fire_and_forget() {
        let (conn, mut server) = connect(test_config(FramerKind::RtuOverTcp));
        let started = Instant::now();
        conn.broadcast(Request::WriteSingleCoil {
            addr: 3,
            value: true,
        })
        .await
        .unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
        // the frame went out with device id 0
        let mut buf = [0_u8; 16];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(n, 8);
        assert_eq!(buf[0], 0);
    }

    #[tokio::test]
    async fn test_broadcast_read_rejected() {
        let (conn, _server) = connect(test_config(FramerKind::RtuOverTcp));
        let err = conn
            .broadcast(Request::ReadCoils { addr: 0, cnt: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        let err = conn
            .transact(0, Request::ReadCoils { addr: 0, cnt: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_count_validation_rejected_before_send() {
        let (conn, _server) = connect(test_config(FramerKind::Socket));
        let err = conn
            .transact(1, Request::ReadCoils { addr: 0, cnt: 5000 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_mismatched_function_code_is_invalid_frame() {
        let (conn, server) = connect(test_config(FramerKind::Socket));
        let task = tokio::spawn(async move {
            let mut server = TestServer::new(server);
            let frame = server.next_request().await;
            server
                .respond(
                    frame.transaction_id,
                    1,
                    &Response::ReadCoils { bits: vec![true] },
                )
                .await;
        });
        let err = conn
            .transact(1, Request::ReadHoldingRegisters { addr: 0, cnt: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFrame(_)));
        task.await.unwrap();
    }
}
