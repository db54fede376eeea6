//! Byte-stream transport abstraction.
//!
//! The engine never opens sockets or serial ports; it drives anything that
//! implements [`Transport`]. [`StreamTransport`] adapts a tokio
//! `AsyncRead + AsyncWrite` stream (a `TcpStream`, a serial port handle, or a
//! `tokio::io::duplex` pipe in tests), optionally reconnecting through a
//! factory closure.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use mbsrv_protocol::{Error, Result};

#[async_trait]
pub trait Transport: Send {
    /// Establish the connection. A no-op if already connected.
    async fn connect(&mut self) -> Result<()>;

    /// Write all of `data`, returning the number of bytes written.
    async fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Read up to `max` bytes. An empty result means the peer closed the
    /// stream.
    async fn recv(&mut self, max: usize) -> Result<Vec<u8>>;

    async fn close(&mut self);

    fn is_connected(&self) -> bool;

    /// Event hooks, invoked by the connection task.
    fn on_connected(&mut self) {}
    fn on_disconnected(&mut self) {}
}

type ConnectFn<T> =
    Box<dyn FnMut() -> Pin<Box<dyn Future<Output = Result<T>> + Send>> + Send>;

/// Adapts an `AsyncRead + AsyncWrite` stream to [`Transport`].
pub struct StreamTransport<T: AsyncRead + AsyncWrite + Unpin + Send> {
    stream: Option<T>,
    connect: Option<ConnectFn<T>>,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamTransport<T> {
    /// Wrap an already-connected stream. Once the stream breaks, the
    /// transport stays disconnected.
    pub fn new(stream: T) -> Self {
        Self {
            stream: Some(stream),
            connect: None,
        }
    }

    /// Create a transport that (re)connects by invoking `connect`.
    pub fn with_connector<F, Fut>(mut connect: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            stream: None,
            connect: Some(Box::new(move || Box::pin(connect()))),
        }
    }

    fn stream(&mut self) -> Result<&mut T> {
        self.stream.as_mut().ok_or(Error::ConnectionLost)
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for StreamTransport<T> {
    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        match &mut self.connect {
            Some(connect) => {
                self.stream = Some(connect().await?);
                Ok(())
            }
            None => Err(Error::ConnectionLost),
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream()?;
        stream.write_all(data).await.map_err(Error::transport)?;
        Ok(data.len())
    }

    async fn recv(&mut self, max: usize) -> Result<Vec<u8>> {
        let stream = self.stream()?;
        let mut buf = vec![0_u8; max];
        let n = stream.read(&mut buf).await.map_err(Error::transport)?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
