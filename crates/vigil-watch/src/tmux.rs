//! tmux session lifecycle: create/attach/list/kill plus output capture.
//!
//! Sessions are named `<prefix>-<watcher name>` and can be attached from any
//! terminal with `tmux attach-session`. Output capture goes through the
//! control channel when it can be established, otherwise through the
//! pipe-pane fallback; the decision is made exactly once at attach time.

use std::path::Path;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_types::{ProcessHandle, SessionLookup, VigilError, WatchConfig};

use crate::supervisor::ProcessSupervisor;
use crate::{control, pipe};

/// Check whether tmux is available on the system.
pub fn multiplexer_available() -> bool {
    std::process::Command::new("tmux")
        .arg("-V")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Run a tmux command, returning its stdout on success.
pub(crate) async fn run_tmux(args: &[&str]) -> Result<String, VigilError> {
    let verb = args.first().copied().unwrap_or("");
    let output = Command::new("tmux")
        .args(args)
        .output()
        .await
        .map_err(|e| VigilError::Transport(format!("tmux {verb}: {e}")))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(VigilError::Transport(format!(
            "tmux {verb} exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}

async fn has_session(name: &str) -> bool {
    run_tmux(&["has-session", "-t", name]).await.is_ok()
}

/// Build the shell command string run inside a new session, exporting env
/// vars first. Values are single-quoted with embedded quotes escaped.
fn shell_command(command: &str, args: &[String], env: &[(String, String)]) -> String {
    let mut cmd = String::new();
    for (key, val) in env {
        let escaped = val.replace('\'', "'\\''");
        cmd.push_str(&format!("export {key}='{escaped}'; "));
    }
    cmd.push_str(command);
    for arg in args {
        let escaped = arg.replace('\'', "'\\''");
        cmd.push_str(&format!(" '{escaped}'"));
    }
    cmd
}

/// Parse one `list-panes -F "#{pane_id} #{pane_pid}"` line.
fn parse_pane_info(line: &str) -> Result<(String, u32), SessionLookup> {
    let (pane, pid) = line
        .trim()
        .split_once(' ')
        .ok_or_else(|| SessionLookup::PaneInfoMalformed {
            detail: format!("expected \"<pane> <pid>\", got {line:?}"),
        })?;
    let pid: u32 = pid.parse().map_err(|_| SessionLookup::BadPanePid {
        value: pid.to_string(),
    })?;
    Ok((pane.to_string(), pid))
}

/// Creates, attaches to, lists, and kills tmux sessions, resolving each
/// session to a supervisable process plus a pane id and wiring up output
/// capture. Liveness pollers are scoped to the manager, not the caller.
pub struct SessionManager {
    supervisor: Arc<ProcessSupervisor>,
    config: WatchConfig,
    /// Serializes FIFO setup across all watchers (see `pipe`).
    pipe_setup: Arc<Mutex<()>>,
    /// Cancels every liveness poller when the manager shuts down.
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(supervisor: Arc<ProcessSupervisor>, config: WatchConfig) -> Self {
        Self {
            supervisor,
            config,
            pipe_setup: Arc::new(Mutex::new(())),
            shutdown: CancellationToken::new(),
        }
    }

    /// The tmux session name for a watcher name.
    pub fn session_name(&self, watcher_name: &str) -> String {
        format!("{}-{}", self.config.session_prefix, watcher_name)
    }

    /// Create a detached session running `command`, resolve it to a process
    /// handle, wire output capture, and start a liveness poller.
    ///
    /// A fresh session may not be queryable immediately, so the attach is
    /// retried with fixed backoff up to the configured attempt count; after
    /// that, creation fails rather than retrying forever.
    pub async fn create_session(
        &self,
        name: &str,
        command: &str,
        args: &[String],
        cwd: &Path,
        env: &[(String, String)],
    ) -> Result<ProcessHandle, VigilError> {
        let session = self.session_name(name);

        // Kill any stale session with this name.
        let _ = run_tmux(&["kill-session", "-t", &session]).await;

        let shell_cmd = shell_command(command, args, env);
        let cwd_str = cwd.to_string_lossy().into_owned();
        run_tmux(&[
            "new-session",
            "-d",
            "-s",
            &session,
            "-x",
            "200",
            "-y",
            "50",
            "-c",
            &cwd_str,
            &shell_cmd,
        ])
        .await
        .map_err(|e| VigilError::Spawn(format!("tmux new-session for {session:?}: {e}")))?;

        info!(session, command, "session created");

        // Brief settle before the first resolution attempt.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let handle = match self.attach_with_retry(&session).await {
            Ok(handle) => handle,
            Err(e) => {
                // The session exists but nothing supervises it; don't leave
                // it running.
                let _ = run_tmux(&["kill-session", "-t", &session]).await;
                return Err(e);
            }
        };
        self.spawn_liveness_poller(session, handle.clone());
        Ok(handle)
    }

    /// Attach with fixed backoff and a bounded attempt count.
    pub async fn attach_with_retry(&self, session: &str) -> Result<ProcessHandle, VigilError> {
        let attempts = self.config.attach_retries.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.attach_to_session(session).await {
                Ok(handle) => return Ok(handle),
                Err(e @ VigilError::SessionNotFound { .. }) => {
                    debug!(session, attempt, error = %e, "attach not ready, retrying");
                    last_err = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.config.attach_backoff()).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| VigilError::SessionNotFound {
            name: session.to_string(),
            stage: SessionLookup::SessionMissing,
        }))
    }

    /// Resolve a session to its first pane's process, attach the supervisor
    /// to that pid, and wire output capture for the pane.
    pub async fn attach_to_session(&self, session: &str) -> Result<ProcessHandle, VigilError> {
        let (pane, pid) = self.resolve_pane(session).await?;
        let handle = self.supervisor.attach(pid)?;
        if let Err(e) = self.pipe_session(&handle, session, &pane).await {
            // Undo the attach so a failed capture does not leak an entry.
            self.supervisor.release(handle.id).await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Two sequential lookups: session existence, then first pane id + pid.
    /// Each failure mode is surfaced as a distinct typed error.
    async fn resolve_pane(&self, session: &str) -> Result<(String, u32), VigilError> {
        if !has_session(session).await {
            return Err(VigilError::SessionNotFound {
                name: session.to_string(),
                stage: SessionLookup::SessionMissing,
            });
        }

        let output = run_tmux(&["list-panes", "-t", session, "-F", "#{pane_id} #{pane_pid}"])
            .await
            .map_err(|_| VigilError::SessionNotFound {
                name: session.to_string(),
                stage: SessionLookup::SessionMissing,
            })?;

        let line = output.lines().next().unwrap_or("");
        parse_pane_info(line).map_err(|stage| VigilError::SessionNotFound {
            name: session.to_string(),
            stage,
        })
    }

    /// Transport selection: try the control channel once; on a typed failure
    /// fall back to the pipe transport. Only a failing fallback surfaces.
    pub async fn pipe_session(
        &self,
        handle: &ProcessHandle,
        session: &str,
        target_pane: &str,
    ) -> Result<(), VigilError> {
        let injector = self
            .supervisor
            .injector(handle.id)
            .ok_or_else(|| VigilError::Transport(format!("no process entry for {}", handle.id)))?;

        let transport = match control::attempt(session, target_pane, injector.clone()).await {
            Ok(t) => t,
            Err(e) => {
                warn!(session, error = %e, "control channel unavailable, using pipe transport");
                pipe::attach(target_pane, injector, &self.pipe_setup).await?
            }
        };
        self.supervisor.attach_transport(handle.id, transport)
    }

    /// List session names. "No server running" is an empty list, not an error.
    pub async fn list_sessions(&self) -> Result<Vec<String>, VigilError> {
        match run_tmux(&["list-sessions", "-F", "#{session_name}"]).await {
            Ok(output) => Ok(output.lines().map(str::to_string).collect()),
            Err(VigilError::Transport(msg))
                if msg.contains("no server running") || msg.contains("No such file") =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Kill a session by name. A session that is already gone is success.
    pub async fn kill_session(&self, session: &str) -> Result<(), VigilError> {
        match run_tmux(&["kill-session", "-t", session]).await {
            Ok(_) => Ok(()),
            Err(VigilError::Transport(msg))
                if msg.contains("session not found")
                    || msg.contains("no server running")
                    || msg.contains("can't find session") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn session_exists(&self, session: &str) -> bool {
        has_session(session).await
    }

    /// Cancel all liveness pollers. Called when the owning orchestrator
    /// shuts down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Poll session existence until it disappears, then drive the normal
    /// exit flow by killing the resolved handle. This is the only way
    /// externally-terminated sessions are observed.
    fn spawn_liveness_poller(&self, session: String, handle: ProcessHandle) {
        let supervisor = self.supervisor.clone();
        let cancel = self.shutdown.clone();
        let interval = self.config.liveness_poll();
        let grace = self.config.kill_grace();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if !supervisor.is_registered(handle.id) {
                    // Watcher stopped through the normal path.
                    break;
                }
                if !has_session(&session).await {
                    info!(session, id = %handle.id, "session disappeared, driving exit");
                    if let Err(e) = supervisor.kill(&handle, grace).await {
                        warn!(session, error = %e, "kill after session loss failed");
                    }
                    break;
                }
            }
        });
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
