use std::time::Duration;

use serde::Deserialize;

use crate::error::EngineError;
use crate::error::Result;

/// Engine tuning knobs. Every field has a default; deployments override the
/// few they care about from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Base URL the stream endpoint lives under.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// How long one open attempt may take before it is torn down and the
    /// refresh/retry path kicks in.
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Pause between a successful credential refresh and the reconnect.
    #[serde(default = "default_refresh_pause_ms")]
    pub refresh_pause_ms: u64,

    /// Reconnect attempts allowed after the one-shot refresh.
    #[serde(default = "default_max_retries")]
    pub max_retries_after_refresh: u32,

    /// First backoff delay; doubles per attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// A stream silent for this long is treated as a transport drop.
    #[serde(default = "default_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,

    /// Capacity of the decoded-event channel between the transport pump and
    /// the turn driver.
    #[serde(default = "default_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_base_url() -> String {
    "https://localhost".to_string()
}

fn default_open_timeout_ms() -> u64 {
    5_000
}

fn default_refresh_pause_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_idle_timeout_ms() -> u64 {
    75_000
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            open_timeout_ms: default_open_timeout_ms(),
            refresh_pause_ms: default_refresh_pause_ms(),
            max_retries_after_refresh: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            stream_idle_timeout_ms: default_idle_timeout_ms(),
            event_channel_capacity: default_channel_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| EngineError::InvalidConfig(err.to_string()))
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn refresh_pause(&self) -> Duration {
        Duration::from_millis(self.refresh_pause_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }
}
