//! ELM327 command framing and the adapter initialization sequence

use std::fmt::{self, Write};
use std::time::Duration;

/// Terminator appended to every command on the wire
pub const COMMAND_TERMINATOR: u8 = b'\r';

/// Emitted by the adapter when it is ready for the next command
pub const PROMPT: char = '>';

/// Identity marker in the reset banner (e.g. "ELM327 v1.5")
pub const ADAPTER_IDENTITY: &str = "ELM327";

/// Affirmative acknowledgement for AT commands
pub const ACKNOWLEDGEMENT: &str = "OK";

/// Encode a command as ASCII bytes followed by the terminator.
///
/// Non-ASCII characters are sent as `?`.
pub fn encode_command(text: &str) -> Vec<u8> {
    let mut bytes: Vec<u8> = text
        .chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect();
    bytes.push(COMMAND_TERMINATOR);
    bytes
}

/// Decode adapter output as ASCII with control bytes made visible.
///
/// `\r`, `\n` and `\t` become their backslash escapes, other bytes below
/// 0x20 become `\xHH`. Bytes outside ASCII decode to U+FFFD. The mapping is
/// for display only and cannot be reversed.
pub fn make_visible(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        match byte {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            0x00..=0x1F => {
                let _ = write!(out, "\\x{:02X}", byte);
            }
            0x20..=0x7F => out.push(byte as char),
            _ => out.push(char::REPLACEMENT_CHARACTER),
        }
    }
    out
}

/// One exchange of the initialization handshake
#[derive(Clone, Copy)]
pub struct InitStep {
    /// Command text, without terminator
    pub command: &'static str,
    /// Delay between writing the command and looking for a reply
    pub settle: Duration,
    /// How long to wait for a reply once settled
    pub timeout: Duration,
    validator: fn(&str) -> bool,
}

impl fmt::Debug for InitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitStep")
            .field("command", &self.command)
            .field("settle", &self.settle)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl InitStep {
    /// Build a step from its command, timing and reply validator
    pub const fn new(
        command: &'static str,
        settle: Duration,
        timeout: Duration,
        validator: fn(&str) -> bool,
    ) -> Self {
        Self {
            command,
            settle,
            timeout,
            validator,
        }
    }

    /// Check a raw (unescaped) reply against this step
    pub fn accepts(&self, response: &str) -> bool {
        (self.validator)(response)
    }
}

fn is_reset_banner(response: &str) -> bool {
    response.contains(ADAPTER_IDENTITY) && response.contains(PROMPT)
}

fn is_acknowledged(response: &str) -> bool {
    response.contains(ACKNOWLEDGEMENT)
}

const RESET_SETTLE: Duration = Duration::from_millis(2000);
const AT_SETTLE: Duration = Duration::from_millis(200);
const STEP_TIMEOUT: Duration = Duration::from_millis(2000);

/// Adapter initialization, run in order before the link is usable
pub const INIT_SEQUENCE: [InitStep; 5] = [
    // reset
    InitStep::new("ATZ", RESET_SETTLE, STEP_TIMEOUT, is_reset_banner),
    // echo off
    InitStep::new("ATE0", AT_SETTLE, STEP_TIMEOUT, is_acknowledged),
    // linefeeds off
    InitStep::new("ATL0", AT_SETTLE, STEP_TIMEOUT, is_acknowledged),
    // spaces off
    InitStep::new("ATS0", AT_SETTLE, STEP_TIMEOUT, is_acknowledged),
    // protocol auto-detect
    InitStep::new("ATSP0", AT_SETTLE, STEP_TIMEOUT, is_acknowledged),
];
