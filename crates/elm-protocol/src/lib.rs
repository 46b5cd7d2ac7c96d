//! ELM327 Wire Protocol
//!
//! This crate holds everything below the connection manager: the narrow
//! [`Transport`] trait and its serial implementation, command framing and
//! response escaping, the fixed adapter initialization sequence, and an
//! in-memory adapter for running without hardware.

mod command;
mod error;
pub mod sim;
mod transport;

pub use command::{
    encode_command, make_visible, InitStep, ACKNOWLEDGEMENT, ADAPTER_IDENTITY,
    COMMAND_TERMINATOR, INIT_SEQUENCE, PROMPT,
};
pub use error::ProtocolError;
pub use sim::{AdapterHandle, SimulatedAdapter};
pub use transport::{
    list_ports, PortInfo, PortSettings, SerialTransport, Transport, DEFAULT_BAUD_RATE,
    DEFAULT_READ_TIMEOUT_MS,
};
