//! Modbus protocol engine.
//!
//! This crate couples the transport-independent PDU layer of
//! `mbsrv_protocol` to concrete byte streams: it contains the four framers
//! (Socket/MBAP, RTU, ASCII, RTU-over-TCP), the per-connection transaction
//! manager, the device-context abstraction servers answer from, and the
//! server dispatcher. Byte-level IO is abstracted behind the
//! [`transport::Transport`] trait; this crate never opens sockets or serial
//! ports itself.

pub mod context;
pub mod framer;
pub mod registry;
pub mod serial;
pub mod server;
pub mod transaction;
pub mod transport;

pub use mbsrv_protocol as protocol;
pub use mbsrv_protocol::{Error, Result};
