//! Named-pipe output capture via `tmux pipe-pane` (fallback transport).
//!
//! Used when the control channel cannot be established. Existing scrollback
//! is captured once and replayed without marking activity; live output then
//! arrives through a FIFO fed by `pipe-pane`. The pipe writer is started
//! before the read end is opened, and FIFO setup is serialized process-wide:
//! opening several named pipes concurrently can cross-wire which reader sees
//! which writer's data.

use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

use nix::poll::{PollFd, PollFlags, PollTimeout};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_types::VigilError;

use crate::supervisor::{EventInjector, Transport};
use crate::tmux::run_tmux;

/// Attach the pipe transport to `target` (a tmux pane target).
///
/// `setup_lock` is the process-wide FIFO setup mutex; it is held across
/// "start writer, open reader" and released on every exit path by guard
/// drop, including failures.
pub async fn attach(
    target: &str,
    injector: EventInjector,
    setup_lock: &Mutex<()>,
) -> Result<Transport, VigilError> {
    // Reset any pre-existing pipe on the pane. Best effort: a pane with no
    // pipe attached is fine.
    if let Err(e) = run_tmux(&["pipe-pane", "-t", target]).await {
        debug!(target, error = %e, "pipe-pane reset failed (ignored)");
    }

    // Replay existing scrollback. Historical data must never look like new
    // activity, so these events do not touch the activity clock.
    match run_tmux(&["capture-pane", "-p", "-t", target]).await {
        Ok(output) => {
            let lines: Vec<&str> = output.lines().collect();
            let last_nonempty = lines.iter().rposition(|l| !l.trim().is_empty());
            if let Some(end) = last_nonempty {
                for line in &lines[..=end] {
                    injector.stdout(*line, false);
                }
            }
        }
        Err(e) => {
            warn!(target, error = %e, "scrollback capture failed");
        }
    }

    let cancel = CancellationToken::new();
    let (dir, fd) = {
        let _guard = setup_lock.lock().await;

        let dir = tempfile::Builder::new()
            .prefix("vigil-pipe-")
            .tempdir()
            .map_err(|e| VigilError::Transport(format!("temp dir: {e}")))?;
        let fifo = dir.path().join("out.pipe");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::from_bits_truncate(0o600))
            .map_err(|e| VigilError::Transport(format!("mkfifo: {e}")))?;

        // Writer first. A read end opened before any writer exists blocks
        // indefinitely, and a writer started against an absent reader can
        // silently drop data.
        run_tmux(&[
            "pipe-pane",
            "-o",
            "-t",
            target,
            &format!("cat >> '{}'", fifo.display()),
        ])
        .await
        .map_err(|e| VigilError::Transport(format!("pipe-pane start: {e}")))?;

        let fd = open_fifo_nonblocking(&fifo)?;
        (dir, fd)
        // _guard drops here: the FIFO pair is wired, the slot is free.
    };

    info!(target, "pipe transport attached");
    let task = spawn_fifo_reader(fd, injector, cancel.clone());

    let cleanup_target = target.to_string();
    Ok(Transport::new(cancel, vec![task]).with_cleanup(async move {
        // Stop the pipe command, then remove the FIFO and its directory.
        // Both best effort: the session may already be gone.
        if let Err(e) = run_tmux(&["pipe-pane", "-t", &cleanup_target]).await {
            debug!(target = cleanup_target, error = %e, "pipe-pane teardown failed (ignored)");
        }
        drop(dir);
    }))
}

/// Open the FIFO read end without blocking on a writer.
pub(crate) fn open_fifo_nonblocking(path: &Path) -> Result<OwnedFd, VigilError> {
    let raw = nix::fcntl::open(
        path,
        nix::fcntl::OFlag::O_RDONLY | nix::fcntl::OFlag::O_NONBLOCK,
        nix::sys::stat::Mode::empty(),
    )
    .map_err(|e| VigilError::Transport(format!("open fifo: {e}")))?;
    // Safety: `open` returned a fresh, valid descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Fork a reader that marks activity and emits a stdout event per chunk.
pub(crate) fn spawn_fifo_reader(
    fd: OwnedFd,
    injector: EventInjector,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match poll_fifo(&fd, 200) {
                Ok(false) => {}
                Ok(true) => match nix::unistd::read(fd.as_raw_fd(), &mut buf) {
                    Ok(0) | Err(nix::errno::Errno::EAGAIN) => {
                        // Writer side closed (or spurious wakeup); the
                        // liveness poller notices a dead session, so just
                        // avoid spinning on POLLHUP.
                        std::thread::sleep(std::time::Duration::from_millis(100));
                    }
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        injector.stdout(chunk, true);
                    }
                    Err(e) => {
                        injector.error(format!("pipe read: {e}"));
                        break;
                    }
                },
                Err(e) => {
                    injector.error(format!("pipe poll: {e}"));
                    break;
                }
            }
        }
    })
}

fn poll_fifo(fd: &OwnedFd, timeout_ms: u32) -> Result<bool, VigilError> {
    let borrowed = fd.as_fd();
    let mut poll_fd = [PollFd::new(borrowed, PollFlags::POLLIN)];
    let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX);
    match nix::poll::poll(&mut poll_fd, timeout) {
        Ok(0) => Ok(false),
        Ok(_) => {
            let revents = poll_fd[0].revents().unwrap_or(PollFlags::empty());
            Ok(revents.contains(PollFlags::POLLIN) || revents.contains(PollFlags::POLLHUP))
        }
        Err(nix::errno::Errno::EINTR) => Ok(false),
        Err(e) => Err(VigilError::Transport(format!("poll fifo: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{ProcessEventKind, ProcessSupervisor};
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;
    use vigil_types::SilenceConfig;

    fn no_silence() -> SilenceConfig {
        SilenceConfig {
            check_interval_ms: 1_000,
            threshold_ms: 3_600_000,
        }
    }

    #[tokio::test]
    async fn fifo_reader_forwards_chunks() {
        let sup = ProcessSupervisor::new();
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let handle = sup.attach(child.id()).expect("attach");
        let injector = sup.injector(handle.id).expect("injector");
        let mut stream = sup.monitor(&handle, no_silence()).expect("monitor");

        let dir = tempfile::tempdir().expect("tempdir");
        let fifo = dir.path().join("out.pipe");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::from_bits_truncate(0o600))
            .expect("mkfifo");

        // Writer before reader, as the transport does.
        let writer_path = fifo.clone();
        let writer = std::thread::spawn(move || {
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .open(writer_path)
                .expect("open write end");
            f.write_all(b"live output").expect("write");
        });

        let fd = open_fifo_nonblocking(&fifo).expect("open read end");
        let cancel = CancellationToken::new();
        let task = spawn_fifo_reader(fd, injector, cancel.clone());

        let ev = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("no event")
            .expect("stream closed");
        assert_eq!(ev.kind, ProcessEventKind::Stdout("live output".into()));

        writer.join().expect("writer thread");
        cancel.cancel();
        task.await.expect("reader task");
        drop(stream);
        sup.kill(&handle, Duration::from_millis(200)).await.expect("kill");
    }

    #[tokio::test]
    async fn setup_lock_serializes_critical_sections() {
        let lock = Arc::new(Mutex::new(()));
        let trace = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..4 {
            let lock = lock.clone();
            let trace = trace.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = lock.lock().await;
                trace.lock().unwrap().push(format!("begin{i}"));
                tokio::time::sleep(Duration::from_millis(10)).await;
                trace.lock().unwrap().push(format!("end{i}"));
            }));
        }
        for t in tasks {
            t.await.expect("task");
        }

        // Every begin marker is immediately followed by its own end marker:
        // no two setups interleaved.
        let trace = trace.lock().unwrap();
        for pair in trace.chunks(2) {
            assert_eq!(pair[0].replace("begin", ""), pair[1].replace("end", ""));
        }
    }

    #[tokio::test]
    async fn lock_released_when_setup_fails_midway() {
        let lock = Mutex::new(());

        // Simulate a failing setup holding the guard; the `?`-style early
        // return must not leave the slot held.
        let result: Result<(), VigilError> = async {
            let _guard = lock.lock().await;
            Err(VigilError::Transport("boom".into()))
        }
        .await;
        assert!(result.is_err());

        // Slot is free again.
        let reacquired = tokio::time::timeout(Duration::from_millis(100), lock.lock()).await;
        assert!(reacquired.is_ok());
    }
}
