//! Connection configuration

use crate::error::LinkError;
use ::config::{Config, Environment, File};
use elm_protocol::{PortSettings, DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `ELM_LINK_BAUD_RATE=115200`
pub const ENV_PREFIX: &str = "ELM_LINK";

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Baud rate used by [`ObdConnection::connect_default`](crate::ObdConnection::connect_default)
    pub baud_rate: u32,

    /// Blocking read timeout applied to the port (milliseconds)
    pub read_timeout_ms: u64,

    /// Idle window before the IO loop polls for inbound bytes (milliseconds)
    pub idle_poll_ms: u64,

    /// Consecutive transport faults tolerated before the IO loop gives up
    pub max_transport_faults: u32,

    /// How long close waits for background tasks to stop (milliseconds)
    pub shutdown_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            idle_poll_ms: 10,
            max_transport_faults: 5,
            shutdown_timeout_ms: 500,
        }
    }
}

impl ConnectionConfig {
    /// Load defaults, then an optional file, then `ELM_LINK_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, LinkError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        Self::from_config(config)
    }

    /// Deserialize from an already built `config::Config`
    pub fn from_config(config: Config) -> Result<Self, LinkError> {
        Ok(config.try_deserialize()?)
    }

    /// Port settings for a connect at `baud_rate`
    pub fn port_settings(&self, baud_rate: u32) -> PortSettings {
        PortSettings::elm327(baud_rate, Duration::from_millis(self.read_timeout_ms))
    }

    /// Idle window of the IO loop
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Bound on waiting for each background task during close
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
