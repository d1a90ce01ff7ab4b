//! Core types shared across the Vigil crates.
//!
//! Defines typed identifiers, the error taxonomy, configuration, and the
//! watcher/log data model used by the supervision core and its consumers.

pub mod config;
pub mod error;
pub mod ids;
pub mod watcher;

pub use config::{SilenceConfig, WatchConfig};
pub use error::{SessionLookup, VigilError};
pub use ids::{ProcessId, WatcherId};
pub use watcher::{
    AgentKind, LogEntry, LogLevel, ProcessHandle, ProcessKind, Watcher, WatcherConfig,
    WatcherStatus,
};
