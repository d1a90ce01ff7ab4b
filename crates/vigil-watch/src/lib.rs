//! Vigil supervision core: processes, tmux sessions, and watchers.
//!
//! Supervises long-running AI coding-agent processes inside tmux sessions,
//! streams their output and lifecycle events, and exposes a per-watcher
//! lifecycle state machine (create/start/stop/status).
//!
//! Layering, leaf first:
//! - [`supervisor`]: spawn/attach/kill OS processes, per-process event queue,
//!   silence detection
//! - [`pty`]: fork/exec helper that puts a child on a real pseudo-terminal
//! - [`control`]: tmux control-mode output channel (preferred transport)
//! - [`pipe`]: named-pipe output capture via `tmux pipe-pane` (fallback)
//! - [`tmux`]: session create/attach/list/kill plus transport selection
//! - [`orchestrator`]: watcher registry, state machine, log buffering and
//!   live log streams

pub mod control;
pub mod logbuf;
pub mod orchestrator;
pub mod pipe;
pub mod pty;
pub mod supervisor;
pub mod tmux;

pub use logbuf::{LogBuffer, LogStream};
pub use orchestrator::WatcherOrchestrator;
pub use supervisor::{EventStream, ProcessEvent, ProcessEventKind, ProcessSupervisor};
pub use tmux::{multiplexer_available, SessionManager};
