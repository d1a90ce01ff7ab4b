//! Configuration for the Vigil supervision core.
//!
//! [`WatchConfig`] is the top-level configuration, loadable from `vigil.toml`,
//! controlling session naming, attach retries, kill escalation, silence
//! detection, and log buffering.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::VigilError;

/// Default configuration filename.
pub const CONFIG_FILENAME: &str = "vigil.toml";

/// Silence detection settings for one monitoring context.
///
/// The idle detector re-checks activity every `check_interval_ms` and emits a
/// single silence event once the gap since the last output exceeds
/// `threshold_ms`. Session-attached and direct-spawn watchers use different
/// thresholds; both are injected per `monitor` call, never hard-coded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SilenceConfig {
    /// How often the idle detector wakes up to check activity.
    pub check_interval_ms: u64,
    /// Gap since last output after which the watcher counts as silent.
    pub threshold_ms: u64,
}

impl SilenceConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms)
    }
}

/// Top-level configuration for the supervision core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchConfig {
    /// Prefix for tmux session names (`<prefix>-<watcher name>`).
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    /// How many times to retry attaching right after session creation.
    /// A fresh session may not be queryable for a short window.
    #[serde(default = "default_attach_retries")]
    pub attach_retries: u32,
    /// Fixed backoff between attach retries.
    #[serde(default = "default_attach_backoff_ms")]
    pub attach_backoff_ms: u64,
    /// Grace period after SIGTERM before escalating to SIGKILL.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Interval for the session liveness poller.
    #[serde(default = "default_liveness_poll_ms")]
    pub liveness_poll_ms: u64,
    /// Silence settings for tmux-attached watchers (aggressive: pane capture
    /// is coarse, so idleness is flagged early).
    #[serde(default = "default_session_silence")]
    pub session_silence: SilenceConfig,
    /// Silence settings for directly-spawned watchers (tolerant: real stdio
    /// is observed, so long thinking pauses are normal).
    #[serde(default = "default_spawn_silence")]
    pub spawn_silence: SilenceConfig,
    /// Maximum buffered log entries per watcher (FIFO eviction).
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

fn default_session_prefix() -> String {
    "vigil".to_string()
}

fn default_attach_retries() -> u32 {
    10
}

fn default_attach_backoff_ms() -> u64 {
    300
}

fn default_kill_grace_ms() -> u64 {
    5_000
}

fn default_liveness_poll_ms() -> u64 {
    2_000
}

fn default_session_silence() -> SilenceConfig {
    SilenceConfig {
        check_interval_ms: 5_000,
        threshold_ms: 30_000,
    }
}

fn default_spawn_silence() -> SilenceConfig {
    SilenceConfig {
        check_interval_ms: 5_000,
        threshold_ms: 120_000,
    }
}

fn default_log_capacity() -> usize {
    1_000
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            session_prefix: default_session_prefix(),
            attach_retries: default_attach_retries(),
            attach_backoff_ms: default_attach_backoff_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            liveness_poll_ms: default_liveness_poll_ms(),
            session_silence: default_session_silence(),
            spawn_silence: default_spawn_silence(),
            log_capacity: default_log_capacity(),
        }
    }
}

impl WatchConfig {
    /// Parse a configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, VigilError> {
        toml::from_str(content).map_err(|e| VigilError::Config(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, VigilError> {
        toml::to_string_pretty(self).map_err(|e| VigilError::Config(e.to_string()))
    }

    pub fn attach_backoff(&self) -> Duration {
        Duration::from_millis(self.attach_backoff_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms)
    }
}
