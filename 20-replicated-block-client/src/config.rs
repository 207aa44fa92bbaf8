//! Session and client configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::DEFAULT_MAX_PAYLOAD;

/// What the dispatcher does when a read response is not exactly
/// `nb_sectors * 512` bytes long.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthPolicy {
    /// Log the mismatch and copy the payload as received.
    #[default]
    Lenient,
    /// Fail the read with `LengthMismatch`; the buffer is left untouched.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Counter value before the first request; the first id is one higher.
    pub initial_id: i32,
    pub length_policy: LengthPolicy,
    /// Largest inbound payload accepted by the frame decoder.
    pub max_payload: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_id: 0,
            length_policy: LengthPolicy::Lenient,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Settings for [`runtime::connect`](crate::runtime::connect).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend address, e.g. "127.0.0.1:7300".
    pub server: String,
    /// Interval between EPOCH_TIMER ticks; `None` disables the ticker.
    pub epoch_interval_ms: Option<u64>,
    /// Socket read size used by the dispatcher thread.
    pub read_chunk: usize,
    /// How long shutdown waits for in-flight responses before closing.
    pub drain_timeout_ms: u64,
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:7300".to_string(),
            epoch_interval_ms: None,
            read_chunk: 64 * 1024,
            drain_timeout_ms: 5_000,
            session: SessionConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn epoch_interval(&self) -> Option<Duration> {
        self.epoch_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}
