//! Process supervision: spawn/attach/kill plus per-process event streams.
//!
//! Every supervised process gets an entry in the injected process table with
//! a private event queue and an activity clock. Spawned children have their
//! stdio captured by reader tasks; attached processes (tmux panes we do not
//! own) get their output injected by a transport instead. `monitor` hands the
//! caller the single live event stream for a process and runs a
//! silence-detection task scoped to that stream's lifetime.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_types::{ProcessHandle, ProcessId, ProcessKind, SilenceConfig, VigilError};

/// What happened to a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEventKind {
    Stdout(String),
    Stderr(String),
    /// A supervision-level failure (read error, transport crash).
    Error(String),
    /// The process exited with this code (negative for signal termination).
    Exit(i32),
    /// No output for longer than the configured silence threshold.
    Silence,
}

/// One event on a process's private queue, consumed once by `monitor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    pub kind: ProcessEventKind,
    pub timestamp: DateTime<Utc>,
    pub process_id: ProcessId,
}

impl ProcessEvent {
    fn now(process_id: ProcessId, kind: ProcessEventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            process_id,
        }
    }
}

/// Monotonic last-activity clock, shared between reader tasks, transports,
/// and the idle detector. Stored as milliseconds since the clock's epoch so
/// it can be updated from sync and async contexts alike.
pub(crate) struct ActivityClock {
    epoch: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Release);
    }

    fn since_last(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Acquire);
        Duration::from_millis(now.saturating_sub(last))
    }
}

type Cleanup = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A running output-capture mechanism bound to one process entry.
///
/// Holds the cancellation token and task handles for the transport's reader
/// loops, plus an optional async cleanup (pipe-pane reset, temp dir removal)
/// that must run exactly once. The supervisor shuts the transport down when
/// the entry is released.
pub struct Transport {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    cleanup: Option<Cleanup>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("cancel", &self.cancel)
            .field("tasks", &self.tasks)
            .field("cleanup", &self.cleanup.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Transport {
    pub(crate) fn new(cancel: CancellationToken, tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            cancel,
            tasks,
            cleanup: None,
        }
    }

    pub(crate) fn with_cleanup(
        mut self,
        cleanup: impl Future<Output = ()> + Send + 'static,
    ) -> Self {
        self.cleanup = Some(Box::pin(cleanup));
        self
    }

    /// Cancel the reader tasks, wait for them to finish, then run cleanup.
    pub(crate) async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.await;
        }
    }
}

/// Handle for feeding events into a process's queue from a transport.
///
/// `mark_activity` controls whether the data counts as fresh output:
/// replayed scrollback must never look like new activity.
#[derive(Clone)]
pub struct EventInjector {
    process_id: ProcessId,
    tx: mpsc::UnboundedSender<ProcessEvent>,
    activity: Arc<ActivityClock>,
    exited: Arc<AtomicBool>,
}

impl EventInjector {
    pub fn stdout(&self, data: impl Into<String>, mark_activity: bool) {
        if mark_activity {
            self.activity.touch();
        }
        let _ = self.tx.send(ProcessEvent::now(
            self.process_id,
            ProcessEventKind::Stdout(data.into()),
        ));
    }

    pub fn error(&self, message: impl Into<String>) {
        let _ = self.tx.send(ProcessEvent::now(
            self.process_id,
            ProcessEventKind::Error(message.into()),
        ));
    }

    /// Emit the exit event at most once per process.
    pub fn exit(&self, code: i32) {
        if !self.exited.swap(true, Ordering::AcqRel) {
            let _ = self
                .tx
                .send(ProcessEvent::now(self.process_id, ProcessEventKind::Exit(code)));
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }
}

/// Slot holding the single receiver for a process's event queue. `monitor`
/// takes it; the returned stream puts it back on drop. This is what enforces
/// at-most-one active output stream per watcher.
type ReceiverSlot = Arc<Mutex<Option<mpsc::UnboundedReceiver<ProcessEvent>>>>;

struct ProcessEntry {
    handle: ProcessHandle,
    tx: mpsc::UnboundedSender<ProcessEvent>,
    events: ReceiverSlot,
    activity: Arc<ActivityClock>,
    exited: Arc<AtomicBool>,
    transport: Option<Transport>,
}

type ProcessTable = Arc<Mutex<HashMap<ProcessId, ProcessEntry>>>;

/// Spawns, attaches to, and kills OS processes, exposing a per-process event
/// stream with idle detection. Owns its process table; independent instances
/// are fully isolated (no module-level state).
pub struct ProcessSupervisor {
    table: ProcessTable,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn register(&self, handle: ProcessHandle) -> (EventInjector, ReceiverSlot) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events: ReceiverSlot = Arc::new(Mutex::new(Some(rx)));
        let activity = Arc::new(ActivityClock::new());
        let exited = Arc::new(AtomicBool::new(false));

        let injector = EventInjector {
            process_id: handle.id,
            tx: tx.clone(),
            activity: activity.clone(),
            exited: exited.clone(),
        };

        let entry = ProcessEntry {
            handle: handle.clone(),
            tx,
            events: events.clone(),
            activity,
            exited,
            transport: None,
        };
        self.table.lock().unwrap().insert(handle.id, entry);
        (injector, events)
    }

    /// Launch a process with stdin closed and stdout/stderr captured.
    ///
    /// Reader tasks forward each output line onto the process's event queue
    /// and touch the activity clock; a wait task emits the exit event and
    /// releases the table entry.
    pub async fn spawn(
        &self,
        command: &str,
        args: &[String],
        env: &[(String, String)],
        cwd: &std::path::Path,
    ) -> Result<ProcessHandle, VigilError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| VigilError::Spawn(format!("{command}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| VigilError::Spawn(format!("{command}: no pid assigned")))?;

        let handle = ProcessHandle::new(pid, ProcessKind::Spawned);
        let (injector, _) = self.register(handle.clone());
        info!(pid, command, id = %handle.id, "process spawned");

        if let Some(stdout) = child.stdout.take() {
            let inj = injector.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    inj.stdout(line, true);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let inj = injector.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    inj.activity.touch();
                    let _ = inj.tx.send(ProcessEvent::now(
                        inj.process_id,
                        ProcessEventKind::Stderr(line),
                    ));
                }
            });
        }

        // Wait task owns the child: emits the exit event and releases the
        // entry so queue and transport go away exactly once.
        let table = self.table.clone();
        let id = handle.id;
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    injector.error(format!("wait failed: {e}"));
                    -1
                }
            };
            debug!(id = %id, code, "process exited");
            injector.exit(code);
            let transport = {
                let mut table = table.lock().unwrap();
                table.remove(&id).and_then(|mut e| e.transport.take())
            };
            if let Some(t) = transport {
                t.shutdown().await;
            }
        });

        Ok(handle)
    }

    /// Register a handle for an externally-running process.
    ///
    /// We cannot capture its stdio directly; output has to arrive through an
    /// attached transport (control channel or pipe-pane).
    pub fn attach(&self, pid: u32) -> Result<ProcessHandle, VigilError> {
        let raw = i32::try_from(pid).map_err(|_| VigilError::Attach {
            pid,
            reason: "pid out of range".into(),
        })?;
        signal::kill(Pid::from_raw(raw), None).map_err(|e| VigilError::Attach {
            pid,
            reason: format!("process not reachable: {e}"),
        })?;

        let handle = ProcessHandle::new(pid, ProcessKind::Attached);
        self.register(handle.clone());
        info!(pid, id = %handle.id, "attached to external process");
        Ok(handle)
    }

    /// The event injector for a registered process, used by transports.
    pub fn injector(&self, id: ProcessId) -> Option<EventInjector> {
        let table = self.table.lock().unwrap();
        table.get(&id).map(|e| EventInjector {
            process_id: e.handle.id,
            tx: e.tx.clone(),
            activity: e.activity.clone(),
            exited: e.exited.clone(),
        })
    }

    /// Bind an output-capture transport to a process entry. The transport is
    /// shut down when the entry is released (exit or kill).
    pub(crate) fn attach_transport(
        &self,
        id: ProcessId,
        transport: Transport,
    ) -> Result<(), VigilError> {
        let mut table = self.table.lock().unwrap();
        match table.get_mut(&id) {
            Some(entry) => {
                if entry.transport.is_some() {
                    return Err(VigilError::Transport(
                        "process already has an output transport".into(),
                    ));
                }
                entry.transport = Some(transport);
                Ok(())
            }
            None => Err(VigilError::Transport(format!(
                "no process entry for {id}"
            ))),
        }
    }

    /// Open the live event stream for a process.
    ///
    /// Only one stream can exist at a time; the receiver returns to its slot
    /// when the stream is dropped. A silence-detection task scoped to the
    /// stream checks the activity clock every `silence.check_interval()` and
    /// emits a single silence event once the gap exceeds the threshold, then
    /// resets the clock so silence does not repeat every cycle.
    pub fn monitor(
        &self,
        handle: &ProcessHandle,
        silence: SilenceConfig,
    ) -> Result<EventStream, VigilError> {
        let (slot, tx, activity, exited) = {
            let table = self.table.lock().unwrap();
            let entry = table
                .get(&handle.id)
                .ok_or_else(|| VigilError::Transport(format!("no process entry for {}", handle.id)))?;
            (
                entry.events.clone(),
                entry.tx.clone(),
                entry.activity.clone(),
                entry.exited.clone(),
            )
        };

        let rx = slot.lock().unwrap().take().ok_or_else(|| {
            VigilError::Transport(format!("process {} is already being monitored", handle.id))
        })?;

        // Fresh streams start the idle clock now; stale pre-monitor gaps
        // should not fire an immediate silence event.
        activity.touch();

        let process_id = handle.id;
        let idle_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(silence.check_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                if exited.load(Ordering::Acquire) {
                    break;
                }
                if activity.since_last() >= silence.threshold() {
                    debug!(id = %process_id, "silence threshold exceeded");
                    if tx
                        .send(ProcessEvent::now(process_id, ProcessEventKind::Silence))
                        .is_err()
                    {
                        break;
                    }
                    // Reset so the next silence needs a fresh full gap.
                    activity.touch();
                }
            }
        });

        Ok(EventStream {
            rx: Some(rx),
            slot,
            idle_task,
        })
    }

    /// Kill a process: graceful SIGTERM, bounded grace wait, SIGKILL
    /// escalation. Attached (non-owned) processes get SIGTERM by pid and a
    /// synthesized exit event, since no child wait exists for them.
    ///
    /// Killing an already-finished process is not an error.
    pub async fn kill(&self, handle: &ProcessHandle, grace: Duration) -> Result<(), VigilError> {
        let (kind, pid, exited) = {
            let table = self.table.lock().unwrap();
            match table.get(&handle.id) {
                Some(entry) => (
                    entry.handle.kind,
                    entry.handle.pid,
                    entry.exited.clone(),
                ),
                // Entry already cleaned up: the process is gone.
                None => return Ok(()),
            }
        };

        if exited.load(Ordering::Acquire) {
            self.release(handle.id).await;
            return Ok(());
        }

        let raw = Pid::from_raw(pid as i32);
        match kind {
            ProcessKind::Spawned => {
                info!(id = %handle.id, pid, "sending SIGTERM");
                match signal::kill(raw, Signal::SIGTERM) {
                    Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                    Err(e) => {
                        return Err(VigilError::Kill {
                            id: handle.id,
                            reason: format!("SIGTERM: {e}"),
                        })
                    }
                }

                if !wait_until_dead(raw, &exited, grace).await {
                    warn!(id = %handle.id, pid, "SIGTERM timeout, sending SIGKILL");
                    let _ = signal::kill(raw, Signal::SIGKILL);
                    wait_until_dead(raw, &exited, Duration::from_secs(2)).await;
                }
                // The wait task reaps the child, emits the exit event, and
                // releases the entry. Release here is a no-op if it already ran.
                self.release(handle.id).await;
            }
            ProcessKind::Attached => {
                info!(id = %handle.id, pid, "terminating attached process");
                match signal::kill(raw, Signal::SIGTERM) {
                    Ok(()) => {
                        if !wait_until_dead(raw, &exited, grace).await {
                            warn!(id = %handle.id, pid, "SIGTERM timeout, sending SIGKILL");
                            let _ = signal::kill(raw, Signal::SIGKILL);
                        }
                    }
                    Err(nix::errno::Errno::ESRCH) => {
                        debug!(id = %handle.id, pid, "attached process already gone");
                    }
                    Err(e) => {
                        return Err(VigilError::Kill {
                            id: handle.id,
                            reason: format!("SIGTERM attached pid {pid}: {e}"),
                        })
                    }
                }
                // No child-process callback exists for attached processes;
                // synthesize the exit ourselves to drive the normal flow.
                if let Some(injector) = self.injector(handle.id) {
                    injector.exit(0);
                }
                self.release(handle.id).await;
            }
        }
        Ok(())
    }

    /// Remove a process entry and shut down its transport. Idempotent.
    pub(crate) async fn release(&self, id: ProcessId) {
        let transport = {
            let mut table = self.table.lock().unwrap();
            table.remove(&id).and_then(|mut e| e.transport.take())
        };
        if let Some(t) = transport {
            t.shutdown().await;
        }
    }

    /// Whether a process is still in the table (not yet released).
    pub fn is_registered(&self, id: ProcessId) -> bool {
        self.table.lock().unwrap().contains_key(&id)
    }

    /// Number of registered processes.
    pub fn process_count(&self) -> usize {
        self.table.lock().unwrap().len()
    }
}

/// Poll until the process is dead or `exited` is flagged, up to `deadline`.
async fn wait_until_dead(pid: Pid, exited: &AtomicBool, deadline: Duration) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if exited.load(Ordering::Acquire) || signal::kill(pid, None).is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    exited.load(Ordering::Acquire) || signal::kill(pid, None).is_err()
}

/// Live, per-call-scoped stream of process events.
///
/// Dropping the stream aborts the idle-detection task and returns the
/// receiver to its slot, so monitoring can be restarted later.
pub struct EventStream {
    rx: Option<mpsc::UnboundedReceiver<ProcessEvent>>,
    slot: ReceiverSlot,
    idle_task: JoinHandle<()>,
}

impl EventStream {
    /// Next event, or `None` once every sender (readers, transports,
    /// injectors) is gone and the queue is drained.
    pub async fn next(&mut self) -> Option<ProcessEvent> {
        self.rx.as_mut()?.recv().await
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.idle_task.abort();
        if let Some(rx) = self.rx.take() {
            *self.slot.lock().unwrap() = Some(rx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fast_silence() -> SilenceConfig {
        SilenceConfig {
            check_interval_ms: 25,
            threshold_ms: 100,
        }
    }

    fn no_silence() -> SilenceConfig {
        SilenceConfig {
            check_interval_ms: 1_000,
            threshold_ms: 3_600_000,
        }
    }

    async fn drain_until_exit(stream: &mut EventStream) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        while let Some(ev) = stream.next().await {
            let is_exit = matches!(ev.kind, ProcessEventKind::Exit(_));
            events.push(ev);
            if is_exit {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn spawn_streams_stdout_and_exit() {
        let sup = ProcessSupervisor::new();
        let handle = sup
            .spawn(
                "sh",
                &["-c".into(), "echo a; echo b".into()],
                &[],
                &PathBuf::from("/tmp"),
            )
            .await
            .expect("spawn failed");

        let mut stream = sup.monitor(&handle, no_silence()).expect("monitor failed");
        let events = drain_until_exit(&mut stream).await;

        let stdout: Vec<&str> = events
            .iter()
            .filter_map(|e| match &e.kind {
                ProcessEventKind::Stdout(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, vec!["a", "b"]);
        assert!(matches!(
            events.last().map(|e| &e.kind),
            Some(ProcessEventKind::Exit(0))
        ));
    }

    #[tokio::test]
    async fn spawn_missing_executable_is_spawn_error() {
        let sup = ProcessSupervisor::new();
        let err = sup
            .spawn(
                "/nonexistent/definitely-not-here",
                &[],
                &[],
                &PathBuf::from("/tmp"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VigilError::Spawn(_)));
    }

    #[tokio::test]
    async fn monitor_is_exclusive_and_restartable() {
        let sup = ProcessSupervisor::new();
        let handle = sup
            .spawn("sleep", &["5".into()], &[], &PathBuf::from("/tmp"))
            .await
            .expect("spawn failed");

        let stream = sup.monitor(&handle, no_silence()).expect("first monitor");
        let second = sup.monitor(&handle, no_silence());
        assert!(matches!(second, Err(VigilError::Transport(_))));

        drop(stream);
        // Receiver returned to its slot: monitoring can restart.
        let _stream = sup.monitor(&handle, no_silence()).expect("restart monitor");

        sup.kill(&handle, Duration::from_secs(5)).await.expect("kill");
    }

    #[tokio::test]
    async fn silence_fires_once_per_gap() {
        let sup = ProcessSupervisor::new();
        let handle = sup
            .spawn("sleep", &["5".into()], &[], &PathBuf::from("/tmp"))
            .await
            .expect("spawn failed");

        let mut stream = sup.monitor(&handle, fast_silence()).expect("monitor");

        let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for silence")
            .expect("stream closed");
        assert!(matches!(first.kind, ProcessEventKind::Silence));

        // The clock resets after firing: no second event within one check
        // interval of the first.
        let quick_second =
            tokio::time::timeout(Duration::from_millis(60), stream.next()).await;
        assert!(quick_second.is_err(), "silence repeated every cycle");

        // But a fresh full gap fires again.
        let second = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for second silence")
            .expect("stream closed");
        assert!(matches!(second.kind, ProcessEventKind::Silence));

        drop(stream);
        sup.kill(&handle, Duration::from_secs(5)).await.expect("kill");
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let sup = ProcessSupervisor::new();
        let handle = sup
            .spawn("sleep", &["30".into()], &[], &PathBuf::from("/tmp"))
            .await
            .expect("spawn failed");

        sup.kill(&handle, Duration::from_secs(5)).await.expect("first kill");
        // Second kill after the process is gone must be a no-op, not an error.
        sup.kill(&handle, Duration::from_secs(5)).await.expect("second kill");
        assert!(!sup.is_registered(handle.id));
    }

    #[tokio::test]
    async fn kill_releases_entry_after_natural_exit() {
        let sup = ProcessSupervisor::new();
        let handle = sup
            .spawn("sh", &["-c".into(), "true".into()], &[], &PathBuf::from("/tmp"))
            .await
            .expect("spawn failed");

        let mut stream = sup.monitor(&handle, no_silence()).expect("monitor");
        let events = drain_until_exit(&mut stream).await;
        assert!(matches!(
            events.last().map(|e| &e.kind),
            Some(ProcessEventKind::Exit(0))
        ));
        drop(stream);

        // Wait task has already released the table entry.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sup.is_registered(handle.id));
        sup.kill(&handle, Duration::from_secs(1)).await.expect("kill after exit");
    }

    #[tokio::test]
    async fn attach_and_kill_synthesizes_exit() {
        let sup = ProcessSupervisor::new();

        // A process we did not spawn through the supervisor's table.
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id();

        let handle = sup.attach(pid).expect("attach failed");
        assert_eq!(handle.kind, ProcessKind::Attached);

        let mut stream = sup.monitor(&handle, no_silence()).expect("monitor");
        // Short grace: the child is never reaped by us (no wait task for
        // attached processes), so the liveness probe keeps seeing the zombie.
        sup.kill(&handle, Duration::from_millis(200)).await.expect("kill");

        let ev = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("no synthesized exit")
            .expect("stream closed");
        assert!(matches!(ev.kind, ProcessEventKind::Exit(_)));
        assert!(!sup.is_registered(handle.id));
    }

    #[tokio::test]
    async fn attach_to_dead_pid_fails() {
        let sup = ProcessSupervisor::new();
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let pid = child.id();
        child.wait().expect("wait");

        // The pid is reaped; attach must surface a typed error.
        let err = sup.attach(pid).unwrap_err();
        assert!(matches!(err, VigilError::Attach { .. }));
    }

    #[tokio::test]
    async fn injected_events_reach_the_stream() {
        let sup = ProcessSupervisor::new();
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let handle = sup.attach(child.id()).expect("attach");

        let injector = sup.injector(handle.id).expect("injector");
        let mut stream = sup.monitor(&handle, no_silence()).expect("monitor");

        injector.stdout("replayed", false);
        injector.stdout("fresh", true);

        let first = stream.next().await.expect("event");
        assert_eq!(first.kind, ProcessEventKind::Stdout("replayed".into()));
        let second = stream.next().await.expect("event");
        assert_eq!(second.kind, ProcessEventKind::Stdout("fresh".into()));

        drop(stream);
        sup.kill(&handle, Duration::from_millis(200)).await.expect("kill");
    }
}
