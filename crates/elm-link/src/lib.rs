//! ELM327 Connection Manager
//!
//! This crate connects to an ELM327-compatible OBD-II adapter, runs its
//! initialization handshake and then multiplexes raw request/response text
//! between callers and the port on a background task.
//!
//! ```no_run
//! use elm_link::{ObdConnection, SerialTransport};
//!
//! # async fn demo() {
//! let conn = ObdConnection::new(SerialTransport::new("/dev/ttyUSB0"));
//! if conn.connect(38400).await {
//!     conn.try_send("0100");
//!     // ... later
//!     if let Some(frame) = conn.try_get_response() {
//!         println!("{frame}");
//!     }
//!     conn.close_connection().await;
//! }
//! # }
//! ```

mod config;
mod connection;
mod consumer;
mod error;
mod handshake;
mod io_loop;
mod logging;
mod state;

pub use crate::config::{ConnectionConfig, ENV_PREFIX};
pub use connection::ObdConnection;
pub use error::{HandshakeFailure, LinkError};
pub use logging::init_logging;
pub use state::ConnectionState;

pub use elm_protocol::{
    list_ports, AdapterHandle, PortInfo, PortSettings, SerialTransport, SimulatedAdapter,
    Transport,
};
