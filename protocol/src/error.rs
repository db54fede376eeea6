//! This module defines the [`enum@Error`] enum, which separates all errors that
//! may occur in the engine into the kinds the rest of the stack dispatches on.

use std::{io, sync::Arc};

use thiserror::Error;

use crate::ExceptionCode;

/// Encodes errors occurring while talking Modbus. The kinds matter more than
/// the payloads:
///
///  * [`Error::InvalidFrame`] - A checksum or structural failure on a received frame.
///  * [`Error::Exception`] - The peer answered with an exception response (function code | 0x80).
///  * [`Error::Timeout`] - No response arrived within the per-request deadline.
///  * [`Error::ConnectionLost`] - The transport disconnected while a transaction was outstanding.
///  * [`Error::InvalidRequest`] - The caller violated an API constraint; nothing was sent.
///  * [`Error::Decode`] - Received bytes could not be decoded into any known PDU.
///  * [`Error::Transport`] - A transport-layer failure such as a broken TCP connection.
///
/// Rare internal failures fall back to [`anyhow::Error`] instead of growing
/// the enum; payloads are wrapped in `Arc` so error values stay `Clone`.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    #[error("Modbus exception: {0}")]
    Exception(ExceptionCode),
    #[error("Timeout")]
    Timeout,
    #[error("Connection lost")]
    ConnectionLost,
    #[error("Invalid request: {0}")]
    InvalidRequest(Arc<anyhow::Error>),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Transport Error {0}")]
    Transport(TransportError),
    #[error("Internal Error {0}")]
    Internal(Arc<anyhow::Error>),
}

impl Error {
    pub fn transport<T: Into<TransportError>>(err: T) -> Self {
        Self::Transport(err.into())
    }

    pub fn invalid_request<T: Into<anyhow::Error>>(err: T) -> Self {
        Self::InvalidRequest(Arc::new(err.into()))
    }

    pub fn internal<T: Into<anyhow::Error>>(err: T) -> Self {
        Self::Internal(Arc::new(err.into()))
    }

    pub fn invalid_frame<T: ToString>(reason: T) -> Self {
        Self::InvalidFrame(reason.to_string())
    }

    pub fn decode<T: ToString>(reason: T) -> Self {
        Self::Decode(reason.to_string())
    }

    /// Determines based on the error kind whether resending the request is
    /// allowed. Exception responses, decode failures and invalid frames are
    /// answers, not losses, and must never be retried.
    pub fn should_retry(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::ConnectionLost => true,
            Error::Transport(TransportError::Io(err)) => {
                err.kind() == io::ErrorKind::ConnectionReset
                    || err.kind() == io::ErrorKind::ConnectionAborted
                    || err.kind() == io::ErrorKind::BrokenPipe
                    || err.kind() == io::ErrorKind::TimedOut
                    || err.kind() == io::ErrorKind::UnexpectedEof
            }
            Error::Transport(TransportError::Other(_)) => false,
            Error::InvalidFrame(_) => false,
            Error::Exception(_) => false,
            Error::InvalidRequest(_) => false,
            Error::Decode(_) => false,
            Error::Internal(_) => false,
        }
    }

    pub fn is_transport_error(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// True for errors after which the connection must be considered broken.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::ConnectionLost | Error::Transport(_))
    }
}

#[derive(Error, Clone, Debug)]
pub enum TransportError {
    #[error("IO Error: {0:?}")]
    Io(Arc<io::Error>),
    #[error("Other Error: {0}")]
    Other(Arc<anyhow::Error>),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(Arc::new(err))
    }
}

impl From<anyhow::Error> for TransportError {
    fn from(x: anyhow::Error) -> Self {
        TransportError::Other(Arc::new(x))
    }
}

impl From<io::Error> for Error {
    fn from(x: io::Error) -> Self {
        Error::Transport(TransportError::Io(Arc::new(x)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_retry_policy() {
        assert!(Error::Timeout.should_retry());
        assert!(Error::ConnectionLost.should_retry());
        assert!(!Error::Exception(ExceptionCode::IllegalDataAddress).should_retry());
        assert!(!Error::Decode("bad byte count".into()).should_retry());
        assert!(!Error::invalid_frame("crc mismatch").should_retry());
        assert!(!Error::invalid_request(anyhow!("count out of range")).should_retry());
        let reset: Error = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(reset.should_retry());
        let denied: Error = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(!denied.should_retry());
        let hangup = Error::transport(anyhow!("stream handed back mid-write"));
        assert!(!hangup.should_retry());
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(Error::ConnectionLost.is_disconnect());
        let broken: Error = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(broken.is_disconnect());
        assert!(broken.is_transport_error());
        assert!(!Error::Timeout.is_disconnect());
    }
}
