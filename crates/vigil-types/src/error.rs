//! Error types shared across all Vigil crates.

use crate::ids::{ProcessId, WatcherId};

/// Which stage of session resolution failed.
///
/// Resolving a tmux session to a supervisable process takes several external
/// lookups; callers (and the GUI) need to tell the stages apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLookup {
    /// No session with this name exists.
    SessionMissing,
    /// `list-panes` returned output we could not split into pane id + pid.
    PaneInfoMalformed { detail: String },
    /// The pane pid field was present but not a number.
    BadPanePid { value: String },
}

impl std::fmt::Display for SessionLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionMissing => write!(f, "session does not exist"),
            Self::PaneInfoMalformed { detail } => write!(f, "malformed pane info: {detail}"),
            Self::BadPanePid { value } => write!(f, "non-numeric pane pid {value:?}"),
        }
    }
}

/// Errors that can occur across the Vigil supervision core.
///
/// Each variant corresponds to a failing subsystem: process spawn/attach/kill,
/// output transports, tmux session resolution, the watcher registry, or
/// configuration. Killing an already-dead process is `Ok`, never an error.
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("cannot attach to pid {pid}: {reason}")]
    Attach { pid: u32, reason: String },

    #[error("kill failed for process {id}: {reason}")]
    Kill { id: ProcessId, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session {name:?} not found: {stage}")]
    SessionNotFound { name: String, stage: SessionLookup },

    #[error("unknown watcher: {0}")]
    WatcherNotFound(WatcherId),

    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_lookup_stages_are_distinguishable() {
        let missing = VigilError::SessionNotFound {
            name: "vigil-x".into(),
            stage: SessionLookup::SessionMissing,
        };
        let malformed = VigilError::SessionNotFound {
            name: "vigil-x".into(),
            stage: SessionLookup::PaneInfoMalformed {
                detail: "no pid field".into(),
            },
        };
        let bad_pid = VigilError::SessionNotFound {
            name: "vigil-x".into(),
            stage: SessionLookup::BadPanePid {
                value: "abc".into(),
            },
        };

        assert!(missing.to_string().contains("does not exist"));
        assert!(malformed.to_string().contains("malformed pane info"));
        assert!(bad_pid.to_string().contains("non-numeric"));
    }

    #[test]
    fn error_messages_carry_context() {
        let id = ProcessId::new();
        let err = VigilError::Kill {
            id,
            reason: "SIGTERM failed".into(),
        };
        assert!(err.to_string().contains(&id.to_string()));
    }
}
