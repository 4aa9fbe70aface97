// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Service configuration (`config.toml`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// PipeWire connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Remote name (`PIPEWIRE_REMOTE` style); `None` connects to the default.
    pub remote: Option<String>,
    /// How long to wait for the initial server round-trip.
    pub handshake_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            remote: None,
            handshake_timeout_ms: 5000,
        }
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms.max(1))
    }
}

/// Graph mirror settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Change notification debounce window.
    pub debounce_ms: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self { debounce_ms: 30 }
    }
}

impl GraphConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Equalizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqConfig {
    /// Rate used to design coefficients before the format is negotiated.
    pub sample_rate: u32,
    /// Delay before recreating a filter that failed.
    pub filter_retry_secs: u64,
    /// Prefix of filter node names; nodes with this prefix are never EQ targets.
    pub node_prefix: String,
}

impl Default for EqConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            filter_retry_secs: 5,
            node_prefix: "eqsplice.eq.".to_string(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default `tracing` directive, extended by `RUST_LOG`.
    pub directive: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directive: "eqsplice=info".to_string(),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub eq: EqConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// Load config from TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
