//! In-memory ELM327 adapter
//!
//! [`SimulatedAdapter`] implements [`Transport`] without hardware. Replies are
//! scripted per command and become readable as soon as the terminated
//! command is written. An [`AdapterHandle`] stays with the caller after the
//! adapter has been moved into a connection, to inspect the wire and inject
//! bytes.

use crate::command::COMMAND_TERMINATOR;
use crate::error::ProtocolError;
use crate::transport::{PortSettings, Transport};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Reply of an ELM327 v1.5 to `0100` (supported PIDs 01-20)
pub const SUPPORTED_PIDS_REPLY: &[u8] = b"41 00 BE 3B B0 11\r\r>";

#[derive(Debug, Default)]
struct AdapterState {
    open: bool,
    settings: Option<PortSettings>,
    written: Vec<u8>,
    inbound: VecDeque<u8>,
    /// Bytes of a command not yet terminated
    partial: Vec<u8>,
    replies: HashMap<String, Vec<u8>>,
    /// Reply to commands with no scripted entry
    fallback: Option<Vec<u8>>,
    fail_open: bool,
    fail_io: bool,
}

impl AdapterState {
    fn check_io(&self) -> Result<(), ProtocolError> {
        if !self.open {
            return Err(ProtocolError::NotOpen);
        }
        if self.fail_io {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated fault").into());
        }
        Ok(())
    }

    fn accept_write(&mut self, buf: &[u8]) {
        self.written.extend_from_slice(buf);
        for &byte in buf {
            if byte != COMMAND_TERMINATOR {
                self.partial.push(byte);
                continue;
            }

            let command = String::from_utf8_lossy(&self.partial).trim().to_string();
            self.partial.clear();
            let reply = self
                .replies
                .get(&command)
                .or(self.fallback.as_ref())
                .cloned()
                .unwrap_or_default();
            debug!("Simulated adapter got {:?}, replying {} bytes", command, reply.len());
            self.inbound.extend(reply);
        }
    }
}

fn lock(state: &Mutex<AdapterState>) -> MutexGuard<'_, AdapterState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted adapter usable wherever a [`Transport`] is expected
pub struct SimulatedAdapter {
    state: Arc<Mutex<AdapterState>>,
}

impl SimulatedAdapter {
    /// An adapter that never answers until scripted
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AdapterState::default())),
        }
    }

    /// An adapter that answers the initialization sequence like a genuine
    /// ELM327 v1.5, `0100` with [`SUPPORTED_PIDS_REPLY`] and anything else
    /// with `?`.
    pub fn elm327() -> Self {
        let adapter = Self::new();
        let handle = adapter.handle();
        handle.reply("ATZ", b"\r\rELM327 v1.5\r\r>");
        // echo is still on when ATE0 arrives
        handle.reply("ATE0", b"ATE0\rOK\r\r>");
        handle.reply("ATL0", b"OK\r\r>");
        handle.reply("ATS0", b"OK\r\r>");
        handle.reply("ATSP0", b"OK\r\r>");
        handle.reply("0100", SUPPORTED_PIDS_REPLY);
        lock(&adapter.state).fallback = Some(b"?\r\r>".to_vec());
        adapter
    }

    /// Handle for inspecting the adapter after it has been moved
    pub fn handle(&self) -> AdapterHandle {
        AdapterHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimulatedAdapter {
    fn name(&self) -> &str {
        "simulated"
    }

    fn open(&mut self, settings: &PortSettings) -> Result<(), ProtocolError> {
        let mut state = lock(&self.state);
        if state.fail_open {
            return Err(ProtocolError::Open {
                port: "simulated".to_string(),
                reason: "simulated open failure".to_string(),
            });
        }
        state.open = true;
        state.settings = Some(*settings);
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize, ProtocolError> {
        let state = lock(&self.state);
        state.check_io()?;
        Ok(state.inbound.len())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let mut state = lock(&self.state);
        state.check_io()?;
        let count = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<usize, ProtocolError> {
        let mut state = lock(&self.state);
        state.check_io()?;
        state.accept_write(buf);
        Ok(buf.len())
    }

    fn close(&mut self) {
        lock(&self.state).open = false;
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open
    }
}

/// Shared view of a [`SimulatedAdapter`]
#[derive(Clone)]
pub struct AdapterHandle {
    state: Arc<Mutex<AdapterState>>,
}

impl AdapterHandle {
    /// Script the reply to `command`
    pub fn reply(&self, command: &str, response: &[u8]) {
        lock(&self.state)
            .replies
            .insert(command.to_string(), response.to_vec());
    }

    /// Make the adapter ignore `command`
    pub fn silence(&self, command: &str) {
        self.reply(command, b"");
    }

    /// Queue bytes as if the adapter had sent them unprompted
    pub fn push_inbound(&self, bytes: &[u8]) {
        lock(&self.state).inbound.extend(bytes.iter().copied());
    }

    /// Everything written to the adapter so far
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    /// [`Self::written`] as text
    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    /// Whether the adapter is currently open
    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    /// Settings from the most recent successful open
    pub fn settings(&self) -> Option<PortSettings> {
        lock(&self.state).settings
    }

    /// Make the next opens fail
    pub fn fail_open(&self, fail: bool) {
        lock(&self.state).fail_open = fail;
    }

    /// Make every read, write and availability check fail
    pub fn fail_io(&self, fail: bool) {
        lock(&self.state).fail_io = fail;
    }
}
