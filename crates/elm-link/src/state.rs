//! Connection lifecycle state

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of an [`ObdConnection`](crate::ObdConnection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Not yet connected
    Disconnected,
    /// Handshake succeeded, background tasks running
    Connected,
    /// Torn down; terminal
    Closed,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Closed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connected,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Atomic cell holding a [`ConnectionState`].
///
/// Only forward transitions are possible: nothing returns to
/// `Disconnected`.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Disconnected.as_u8()))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// `Disconnected -> Connected`. Fails if the cell has moved on.
    pub(crate) fn mark_connected(&self) -> Result<(), ConnectionState> {
        self.0
            .compare_exchange(
                ConnectionState::Disconnected.as_u8(),
                ConnectionState::Connected.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }

    /// Move to `Closed`, returning the previous state
    pub(crate) fn mark_closed(&self) -> ConnectionState {
        ConnectionState::from_u8(
            self.0
                .swap(ConnectionState::Closed.as_u8(), Ordering::AcqRel),
        )
    }
}
