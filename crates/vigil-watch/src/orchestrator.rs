//! Watcher registry and lifecycle state machine.
//!
//! The orchestrator is the high-level API: create a watcher from a config,
//! and it launches the agent (tmux session or direct child), monitors the
//! event stream, folds events into the status machine
//! (`starting -> running -> idle -> stopped`, `errored` from any non-terminal
//! state), and buffers output as log entries with live subscriptions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_types::{
    AgentKind, LogEntry, LogLevel, ProcessHandle, SilenceConfig, VigilError, WatchConfig, Watcher,
    WatcherConfig, WatcherId, WatcherStatus,
};

use crate::logbuf::{LogBuffer, LogStream};
use crate::supervisor::{ProcessEvent, ProcessEventKind, ProcessSupervisor};
use crate::tmux::SessionManager;

/// Mutable per-watcher state shared between the registry and the watcher's
/// background tasks.
struct WatcherState {
    id: WatcherId,
    name: String,
    agent: AgentKind,
    handle: ProcessHandle,
    created_at: DateTime<Utc>,
    /// tmux session name, when the watcher runs inside one.
    session: Option<String>,
    silence: SilenceConfig,
    status: Mutex<WatcherStatus>,
    last_activity: Mutex<DateTime<Utc>>,
    logs: Mutex<LogBuffer>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WatcherState {
    fn snapshot(&self) -> Watcher {
        Watcher {
            id: self.id,
            name: self.name.clone(),
            agent: self.agent,
            handle: self.handle.clone(),
            status: *self.status.lock().unwrap(),
            created_at: self.created_at,
            last_activity_at: *self.last_activity.lock().unwrap(),
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.logs
            .lock()
            .unwrap()
            .push(LogEntry::new(self.id, level, message));
    }

    /// Transition, unless the current status is terminal.
    fn set_status(&self, next: WatcherStatus) {
        let mut status = self.status.lock().unwrap();
        if status.is_terminal() || *status == next {
            return;
        }
        debug!(id = %self.id, from = %*status, to = %next, "status change");
        *status = next;
    }

    fn touch_activity(&self) {
        *self.last_activity.lock().unwrap() = Utc::now();
    }

    /// Fold one process event into status and logs. Returns `false` once the
    /// watcher reached its terminal state.
    fn apply_event(&self, event: ProcessEvent) -> bool {
        match event.kind {
            ProcessEventKind::Stdout(line) => {
                self.touch_activity();
                self.log(LogLevel::Stdout, line);
                self.set_status(WatcherStatus::Running);
                true
            }
            ProcessEventKind::Stderr(line) => {
                self.touch_activity();
                self.log(LogLevel::Stderr, line);
                self.set_status(WatcherStatus::Running);
                true
            }
            ProcessEventKind::Silence => {
                self.log(LogLevel::Debug, "no output within silence threshold");
                // Only a running watcher goes idle. A starting watcher has
                // produced nothing yet (the settle task handles it), and an
                // errored one must not have its error state masked.
                if *self.status.lock().unwrap() == WatcherStatus::Running {
                    self.set_status(WatcherStatus::Idle);
                }
                true
            }
            ProcessEventKind::Error(message) => {
                self.log(LogLevel::Error, message);
                self.set_status(WatcherStatus::Errored);
                true
            }
            ProcessEventKind::Exit(code) => {
                self.log(LogLevel::Info, format!("process exited with code {code}"));
                self.set_status(WatcherStatus::Stopped);
                false
            }
        }
    }
}

type Registry = Arc<Mutex<HashMap<WatcherId, Arc<WatcherState>>>>;

/// Owns the watcher registry and coordinates supervisor and session manager.
pub struct WatcherOrchestrator {
    supervisor: Arc<ProcessSupervisor>,
    sessions: Arc<SessionManager>,
    config: WatchConfig,
    registry: Registry,
}

impl WatcherOrchestrator {
    pub fn new(config: WatchConfig) -> Self {
        let supervisor = Arc::new(ProcessSupervisor::new());
        let sessions = Arc::new(SessionManager::new(supervisor.clone(), config.clone()));
        Self {
            supervisor,
            sessions,
            config,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Create a watcher: launch (or adopt) the agent process, register it,
    /// and start monitoring. Returns the initial snapshot in `Starting`.
    pub async fn create(&self, watcher_config: WatcherConfig) -> Result<Watcher, VigilError> {
        let (handle, session, silence) = self.acquire_process(&watcher_config).await?;

        let id = WatcherId::new();
        let state = Arc::new(WatcherState {
            id,
            name: watcher_config.name.clone(),
            agent: watcher_config.agent,
            handle,
            created_at: Utc::now(),
            session,
            silence,
            status: Mutex::new(WatcherStatus::Starting),
            last_activity: Mutex::new(Utc::now()),
            logs: Mutex::new(LogBuffer::new(self.config.log_capacity)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        state.log(
            LogLevel::Info,
            format!("watcher created for {} agent", state.agent),
        );

        self.registry.lock().unwrap().insert(id, state.clone());
        info!(id = %id, name = state.name, pid = state.handle.pid, "watcher created");

        self.start_monitor(&state)?;
        self.spawn_startup_settle(&state);
        Ok(state.snapshot())
    }

    /// Resolve the watcher config into a supervised process handle plus the
    /// silence profile that matches how its output is observed.
    async fn acquire_process(
        &self,
        watcher_config: &WatcherConfig,
    ) -> Result<(ProcessHandle, Option<String>, SilenceConfig), VigilError> {
        if let Some(handle) = &watcher_config.attach {
            // Adopt a pre-resolved process. If its registration went away
            // (supervisor restart), re-attach by pid.
            let handle = if self.supervisor.is_registered(handle.id) {
                handle.clone()
            } else {
                self.supervisor.attach(handle.pid)?
            };
            return Ok((handle, None, self.config.session_silence));
        }

        let command = watcher_config.resolved_command().ok_or_else(|| {
            VigilError::Config(format!(
                "agent {} requires an explicit command",
                watcher_config.agent
            ))
        })?;

        if watcher_config.session {
            let handle = self
                .sessions
                .create_session(
                    &watcher_config.name,
                    &command,
                    &watcher_config.args,
                    &watcher_config.working_dir,
                    &watcher_config.env,
                )
                .await?;
            let session = self.sessions.session_name(&watcher_config.name);
            Ok((handle, Some(session), self.config.session_silence))
        } else {
            let handle = self
                .supervisor
                .spawn(
                    &command,
                    &watcher_config.args,
                    &watcher_config.env,
                    &watcher_config.working_dir,
                )
                .await?;
            Ok((handle, None, self.config.spawn_silence))
        }
    }

    /// Open the process event stream and fold it into the watcher state
    /// until cancellation or the terminal event.
    fn start_monitor(&self, state: &Arc<WatcherState>) -> Result<(), VigilError> {
        let mut stream = self.supervisor.monitor(&state.handle, state.silence)?;
        let watcher = state.clone();
        let cancel = state.cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.next() => match event {
                        Some(ev) => {
                            if !watcher.apply_event(ev) {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        state.tasks.lock().unwrap().push(task);
        Ok(())
    }

    /// A watcher that produced no output shortly after launch is assumed to
    /// have started fine; agents often render to the terminal without
    /// emitting pane output we can observe immediately.
    fn spawn_startup_settle(&self, state: &Arc<WatcherState>) {
        let watcher = state.clone();
        let cancel = state.cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            if *watcher.status.lock().unwrap() == WatcherStatus::Starting {
                watcher.set_status(WatcherStatus::Running);
            }
        });
        state.tasks.lock().unwrap().push(task);
    }

    /// Resume monitoring for a watcher whose stream was dropped. No-op when
    /// the watcher is already monitored or its process is gone.
    pub async fn start(&self, id: WatcherId) -> Result<(), VigilError> {
        let state = self.lookup(id)?;
        if *state.status.lock().unwrap() == WatcherStatus::Stopped {
            return Ok(());
        }
        match self.start_monitor(&state) {
            Ok(()) => {
                state.log(LogLevel::Info, "monitoring resumed");
                Ok(())
            }
            Err(e) => {
                // Stream already live, or the process already released its
                // entry. Either way there is nothing to resume.
                debug!(id = %id, error = %e, "start is a no-op");
                Ok(())
            }
        }
    }

    /// Stop a watcher: cancel its tasks, kill the process (and its session),
    /// close the log buffer, and remove it from the registry.
    pub async fn stop(&self, id: WatcherId) -> Result<(), VigilError> {
        let state = self.lookup(id)?;
        info!(id = %id, name = state.name, "stopping watcher");

        state.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = state.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        // Killing an already-finished process is a no-op by contract.
        self.supervisor
            .kill(&state.handle, self.config.kill_grace())
            .await?;

        if let Some(session) = &state.session {
            if let Err(e) = self.sessions.kill_session(session).await {
                warn!(id = %id, session, error = %e, "session kill failed");
            }
        }

        state.set_status(WatcherStatus::Stopped);
        state.log(LogLevel::Info, "watcher stopped");
        state.logs.lock().unwrap().close();
        self.registry.lock().unwrap().remove(&id);
        Ok(())
    }

    /// Stop every watcher and cancel session pollers.
    pub async fn shutdown(&self) {
        let ids: Vec<WatcherId> = self.registry.lock().unwrap().keys().copied().collect();
        for id in ids {
            if let Err(e) = self.stop(id).await {
                warn!(id = %id, error = %e, "stop during shutdown failed");
            }
        }
        self.sessions.shutdown();
    }

    pub fn get(&self, id: WatcherId) -> Result<Watcher, VigilError> {
        Ok(self.lookup(id)?.snapshot())
    }

    pub fn list_all(&self) -> Vec<Watcher> {
        let registry = self.registry.lock().unwrap();
        let mut watchers: Vec<Watcher> = registry.values().map(|s| s.snapshot()).collect();
        watchers.sort_by_key(|w| w.created_at);
        watchers
    }

    pub fn get_status(&self, id: WatcherId) -> Result<WatcherStatus, VigilError> {
        Ok(*self.lookup(id)?.status.lock().unwrap())
    }

    /// Buffered log entries, optionally tail-limited.
    pub fn get_logs(&self, id: WatcherId, limit: Option<usize>) -> Result<Vec<LogEntry>, VigilError> {
        Ok(self.lookup(id)?.logs.lock().unwrap().entries(limit))
    }

    /// Subscribe to a watcher's logs: buffered history first, then live
    /// entries, with no gap or duplicate at the boundary.
    pub fn stream_logs(&self, id: WatcherId) -> Result<LogStream, VigilError> {
        Ok(self.lookup(id)?.logs.lock().unwrap().subscribe())
    }

    /// Sessions visible to the multiplexer, for the session browser.
    pub async fn list_sessions(&self) -> Result<Vec<String>, VigilError> {
        self.sessions.list_sessions().await
    }

    /// Kill a session that is not (or no longer) owned by a watcher.
    pub async fn kill_session(&self, session: &str) -> Result<(), VigilError> {
        self.sessions.kill_session(session).await
    }

    pub async fn session_exists(&self, session: &str) -> bool {
        self.sessions.session_exists(session).await
    }

    fn lookup(&self, id: WatcherId) -> Result<Arc<WatcherState>, VigilError> {
        self.registry
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(VigilError::WatcherNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn direct_config(name: &str, script: &str) -> WatcherConfig {
        WatcherConfig {
            name: name.into(),
            agent: AgentKind::Custom,
            command: Some("sh".into()),
            args: vec!["-c".into(), script.into()],
            working_dir: PathBuf::from("/tmp"),
            env: vec![],
            session: false,
            attach: None,
        }
    }

    fn fast_orchestrator() -> WatcherOrchestrator {
        WatcherOrchestrator::new(WatchConfig {
            kill_grace_ms: 500,
            ..WatchConfig::default()
        })
    }

    async fn wait_for_status(
        orch: &WatcherOrchestrator,
        id: WatcherId,
        want: WatcherStatus,
    ) -> WatcherStatus {
        for _ in 0..100 {
            let status = orch.get_status(id).expect("watcher gone");
            if status == want {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        orch.get_status(id).expect("watcher gone")
    }

    fn bare_state(status: WatcherStatus) -> WatcherState {
        use vigil_types::ProcessKind;
        WatcherState {
            id: WatcherId::new(),
            name: "bare".into(),
            agent: AgentKind::Custom,
            handle: ProcessHandle::new(4242, ProcessKind::Spawned),
            created_at: Utc::now(),
            session: None,
            silence: WatchConfig::default().spawn_silence,
            status: Mutex::new(status),
            last_activity: Mutex::new(Utc::now()),
            logs: Mutex::new(LogBuffer::new(16)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn silence_event(state: &WatcherState) -> ProcessEvent {
        ProcessEvent {
            kind: ProcessEventKind::Silence,
            timestamp: Utc::now(),
            process_id: state.handle.id,
        }
    }

    #[test]
    fn silence_only_downgrades_a_running_watcher() {
        let running = bare_state(WatcherStatus::Running);
        running.apply_event(silence_event(&running));
        assert_eq!(*running.status.lock().unwrap(), WatcherStatus::Idle);

        // Starting is left to the settle task; errored is never masked.
        let starting = bare_state(WatcherStatus::Starting);
        starting.apply_event(silence_event(&starting));
        assert_eq!(*starting.status.lock().unwrap(), WatcherStatus::Starting);

        let errored = bare_state(WatcherStatus::Errored);
        errored.apply_event(silence_event(&errored));
        assert_eq!(*errored.status.lock().unwrap(), WatcherStatus::Errored);
    }

    #[tokio::test]
    async fn watcher_runs_and_stops_on_natural_exit() {
        let orch = fast_orchestrator();
        let watcher = orch
            .create(direct_config("short", "echo hi; sleep 0.2"))
            .await
            .expect("create");
        assert_eq!(watcher.status, WatcherStatus::Starting);

        // First output flips to running, exit flips to stopped.
        assert_eq!(
            wait_for_status(&orch, watcher.id, WatcherStatus::Stopped).await,
            WatcherStatus::Stopped
        );

        let logs = orch.get_logs(watcher.id, None).expect("logs");
        let stdout: Vec<&str> = logs
            .iter()
            .filter(|e| e.level == LogLevel::Stdout)
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(stdout, vec!["hi"]);
        assert!(logs
            .iter()
            .any(|e| e.level == LogLevel::Info && e.message.contains("exited with code 0")));
    }

    #[tokio::test]
    async fn stop_kills_the_process_and_removes_the_watcher() {
        let orch = fast_orchestrator();
        let watcher = orch
            .create(direct_config("long", "sleep 30"))
            .await
            .expect("create");
        assert!(orch.supervisor().is_registered(watcher.handle.id));

        orch.stop(watcher.id).await.expect("stop");

        assert!(!orch.supervisor().is_registered(watcher.handle.id));
        assert!(matches!(
            orch.get(watcher.id),
            Err(VigilError::WatcherNotFound(_))
        ));
        // Stopping again is an error, not a hang.
        assert!(matches!(
            orch.stop(watcher.id).await,
            Err(VigilError::WatcherNotFound(_))
        ));
    }

    #[tokio::test]
    async fn log_stream_replays_history_then_continues_live() {
        let orch = fast_orchestrator();
        let watcher = orch
            .create(direct_config("stream", "echo a; sleep 0.3; echo b"))
            .await
            .expect("create");

        // Let "a" land in the buffer before subscribing.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut stream = orch.stream_logs(watcher.id).expect("stream");
        wait_for_status(&orch, watcher.id, WatcherStatus::Stopped).await;

        let mut stdout = Vec::new();
        while let Some(entry) = stream.try_next() {
            if entry.level == LogLevel::Stdout {
                stdout.push(entry.message);
            }
        }
        assert_eq!(stdout, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn silence_flips_running_to_idle() {
        let orch = WatcherOrchestrator::new(WatchConfig {
            kill_grace_ms: 500,
            spawn_silence: SilenceConfig {
                check_interval_ms: 25,
                threshold_ms: 100,
            },
            ..WatchConfig::default()
        });
        let watcher = orch
            .create(direct_config("quiet", "echo once; sleep 30"))
            .await
            .expect("create");

        wait_for_status(&orch, watcher.id, WatcherStatus::Running).await;
        assert_eq!(
            wait_for_status(&orch, watcher.id, WatcherStatus::Idle).await,
            WatcherStatus::Idle
        );

        orch.stop(watcher.id).await.expect("stop");
    }

    #[tokio::test]
    async fn snapshots_and_logs_serialize_for_the_gui_boundary() {
        let orch = fast_orchestrator();
        let watcher = orch
            .create(direct_config("ser", "echo out"))
            .await
            .expect("create");
        wait_for_status(&orch, watcher.id, WatcherStatus::Stopped).await;

        let snapshot = serde_json::to_string(&orch.get(watcher.id).expect("get")).expect("json");
        assert!(snapshot.contains("\"status\":\"stopped\""));

        let logs =
            serde_json::to_string(&orch.get_logs(watcher.id, None).expect("logs")).expect("json");
        assert!(logs.contains("\"level\":\"stdout\""));
    }

    #[tokio::test]
    async fn start_is_a_noop_while_monitored() {
        let orch = fast_orchestrator();
        let watcher = orch
            .create(direct_config("busy", "sleep 30"))
            .await
            .expect("create");

        orch.start(watcher.id).await.expect("redundant start");
        orch.stop(watcher.id).await.expect("stop");
    }

    #[tokio::test]
    async fn unknown_ids_surface_typed_errors() {
        let orch = fast_orchestrator();
        let id = WatcherId::new();
        assert!(matches!(
            orch.get_status(id),
            Err(VigilError::WatcherNotFound(_))
        ));
        assert!(matches!(
            orch.get_logs(id, None),
            Err(VigilError::WatcherNotFound(_))
        ));
        assert!(matches!(
            orch.stream_logs(id),
            Err(VigilError::WatcherNotFound(_))
        ));
        assert!(matches!(
            orch.start(id).await,
            Err(VigilError::WatcherNotFound(_))
        ));
    }

    #[tokio::test]
    async fn custom_agent_without_command_is_a_config_error() {
        let orch = fast_orchestrator();
        let mut config = direct_config("bad", "true");
        config.command = None;
        let err = orch.create(config).await.unwrap_err();
        assert!(matches!(err, VigilError::Config(_)));
    }

    #[tokio::test]
    async fn list_all_orders_by_creation() {
        let orch = fast_orchestrator();
        let first = orch
            .create(direct_config("one", "sleep 30"))
            .await
            .expect("create one");
        let second = orch
            .create(direct_config("two", "sleep 30"))
            .await
            .expect("create two");

        let all = orch.list_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, first.id);
        assert_eq!(all[1].id, second.id);

        orch.shutdown().await;
        assert!(orch.list_all().is_empty());
    }
}
