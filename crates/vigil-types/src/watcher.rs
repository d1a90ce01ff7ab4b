//! Watcher and process data model.
//!
//! A watcher is a supervised AI-agent process plus its lifecycle and log
//! state. These types cross the boundary to the GUI shell, so everything here
//! is serde-able.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ProcessId, WatcherId};

/// How a process entered the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// Launched by the supervisor; stdio is captured directly.
    Spawned,
    /// Pre-existing process registered by pid. Stdio cannot be captured
    /// directly; output must come from a transport (control channel or
    /// pipe-pane).
    Attached,
}

/// Immutable record of a supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub id: ProcessId,
    pub pid: u32,
    pub kind: ProcessKind,
    pub started_at: DateTime<Utc>,
}

impl ProcessHandle {
    pub fn new(pid: u32, kind: ProcessKind) -> Self {
        Self {
            id: ProcessId::new(),
            pid,
            kind,
            started_at: Utc::now(),
        }
    }
}

/// Which agent CLI a watcher supervises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    ClaudeCode,
    Codex,
    Custom,
}

impl AgentKind {
    /// The default executable for this agent kind. `Custom` has none; the
    /// watcher config must carry an explicit command.
    pub fn default_command(&self) -> Option<&'static str> {
        match self {
            Self::ClaudeCode => Some("claude"),
            Self::Codex => Some("codex"),
            Self::Custom => None,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClaudeCode => write!(f, "claude-code"),
            Self::Codex => write!(f, "codex"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Configuration for creating a watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Human-readable name; also used for the tmux session name.
    pub name: String,
    /// Which agent CLI to run.
    pub agent: AgentKind,
    /// Explicit command override. Required for `AgentKind::Custom`.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the agent process.
    pub working_dir: PathBuf,
    /// Environment variables exported into the session command.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Run inside a tmux session (default) instead of as a direct child.
    #[serde(default = "default_true")]
    pub session: bool,
    /// Attach mode: supervise this pre-resolved process instead of
    /// launching a new one.
    #[serde(default)]
    pub attach: Option<ProcessHandle>,
}

fn default_true() -> bool {
    true
}

impl WatcherConfig {
    /// The command to launch, resolving the agent-kind default.
    pub fn resolved_command(&self) -> Option<String> {
        self.command
            .clone()
            .or_else(|| self.agent.default_command().map(str::to_string))
    }
}

/// Lifecycle status of a watcher.
///
/// `starting -> running -> idle -> stopped`, with `errored` reachable from
/// any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherStatus {
    Starting,
    Running,
    Idle,
    Stopped,
    Errored,
}

impl WatcherStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for WatcherStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Snapshot of a watcher, as exposed to the GUI shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watcher {
    pub id: WatcherId,
    pub name: String,
    pub agent: AgentKind,
    pub handle: ProcessHandle,
    pub status: WatcherStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Severity / source of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Error,
    Debug,
    Stdout,
    Stderr,
}

/// One line of watcher history, buffered in a bounded ring and offered to
/// live log subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub watcher_id: WatcherId,
}

impl LogEntry {
    pub fn new(watcher_id: WatcherId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            watcher_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_kind_default_commands() {
        assert_eq!(AgentKind::ClaudeCode.default_command(), Some("claude"));
        assert_eq!(AgentKind::Codex.default_command(), Some("codex"));
        assert_eq!(AgentKind::Custom.default_command(), None);
    }

    #[test]
    fn watcher_config_resolves_command() {
        let mut config = WatcherConfig {
            name: "demo".into(),
            agent: AgentKind::ClaudeCode,
            command: None,
            args: vec![],
            working_dir: PathBuf::from("/tmp"),
            env: vec![],
            session: true,
            attach: None,
        };
        assert_eq!(config.resolved_command().as_deref(), Some("claude"));

        config.command = Some("/usr/local/bin/claude-nightly".into());
        assert_eq!(
            config.resolved_command().as_deref(),
            Some("/usr/local/bin/claude-nightly")
        );

        config.agent = AgentKind::Custom;
        config.command = None;
        assert_eq!(config.resolved_command(), None);
    }

    #[test]
    fn watcher_config_serde_defaults() {
        let json = r#"{"name":"a","agent":"codex","working_dir":"/tmp"}"#;
        let config: WatcherConfig = serde_json::from_str(json).expect("deserialize");
        assert!(config.session);
        assert!(config.attach.is_none());
        assert!(config.env.is_empty());
    }

    #[test]
    fn status_terminality() {
        assert!(WatcherStatus::Stopped.is_terminal());
        assert!(!WatcherStatus::Errored.is_terminal());
        assert!(!WatcherStatus::Idle.is_terminal());
    }

    #[test]
    fn status_serde_snake_case() {
        let json = serde_json::to_string(&WatcherStatus::Starting).unwrap();
        assert_eq!(json, "\"starting\"");
    }

    #[test]
    fn process_handle_records_kind() {
        let spawned = ProcessHandle::new(42, ProcessKind::Spawned);
        let attached = ProcessHandle::new(42, ProcessKind::Attached);
        assert_eq!(spawned.pid, 42);
        assert_ne!(spawned.id, attached.id);
        assert_eq!(attached.kind, ProcessKind::Attached);
    }
}
