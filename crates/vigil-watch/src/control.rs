//! tmux control-mode output channel (preferred transport).
//!
//! Attaches `tmux -C attach-session` on a real PTY (plain non-interactive
//! capture is not enough; the control client needs an actual terminal
//! device) and parses the newline-delimited protocol into process events:
//! `%output %<pane> <escaped-data>` becomes a stdout event for the watcher's
//! process, `%exit` ends the stream, everything else is ignored.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_types::VigilError;

use crate::pty::PtyChild;
use crate::supervisor::{EventInjector, Transport};

/// One parsed control-mode protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    /// Pane output, already unescaped.
    Output { pane: String, data: String },
    /// The control client is shutting down; ends the stream.
    Exit,
    /// Notifications we do not act on (`%begin`, `%layout-change`, ...).
    Other,
}

/// Parse a single protocol line (without its trailing newline).
pub fn parse_line(line: &str) -> ControlLine {
    let line = line.trim_end_matches('\r');
    if let Some(rest) = line.strip_prefix("%output ") {
        match rest.split_once(' ') {
            Some((pane, data)) if pane.starts_with('%') => ControlLine::Output {
                pane: pane.to_string(),
                data: unescape(data),
            },
            _ => ControlLine::Other,
        }
    } else if line == "%exit" || line.starts_with("%exit ") {
        ControlLine::Exit
    } else {
        ControlLine::Other
    }
}

/// Undo tmux's output escaping: `\\` for a backslash and `\ooo` octal for
/// non-printable bytes. Malformed escapes are passed through verbatim.
pub fn unescape(data: &str) -> String {
    let bytes = data.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            if bytes[i + 1] == b'\\' {
                out.push(b'\\');
                i += 2;
                continue;
            }
            if i + 3 < bytes.len() && bytes[i + 1..i + 4].iter().all(u8::is_ascii_digit) {
                let octal = &data[i + 1..i + 4];
                if let Ok(value) = u8::from_str_radix(octal, 8) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Line-buffered protocol framing: incomplete trailing fragments are kept
/// across reads and prefixed onto the next chunk.
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self { partial: Vec::new() }
    }

    /// Feed raw bytes; returns the newly completed lines.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut completed = Vec::new();
        for &byte in data {
            if byte == b'\n' {
                let raw = std::mem::take(&mut self.partial);
                completed.push(String::from_utf8_lossy(&raw).into_owned());
            } else {
                self.partial.push(byte);
            }
        }
        completed
    }

    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// How long the control client gets to produce its `%begin` banner before
/// the attach counts as failed.
const ATTACH_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

/// Try to open the control channel for `session`, forwarding output of
/// `target_pane` through `injector` as activity-marked stdout events.
///
/// The attach is confirmed before a transport is returned: tmux reports
/// errors ("can't find session", server refused) after the fork, so the
/// client is watched until it prints the `%begin` banner or dies. A typed
/// `Transport` error on any of those paths is what lets the caller fall
/// back to the pipe transport.
pub async fn attempt(
    session: &str,
    target_pane: &str,
    injector: EventInjector,
) -> Result<Transport, VigilError> {
    let args = vec![
        "-C".to_string(),
        "attach-session".to_string(),
        "-t".to_string(),
        session.to_string(),
    ];

    let handshake = tokio::task::spawn_blocking(move || {
        let pty = PtyChild::spawn("tmux", &args)?;
        let mut lines = LineBuffer::new();
        let banner = confirm_attach(&pty, &mut lines)?;
        Ok::<_, VigilError>((pty, lines, banner))
    });
    let (pty, mut lines, banner) = handshake
        .await
        .map_err(|e| VigilError::Transport(format!("control handshake: {e}")))??;

    info!(session, pane = target_pane, "control channel attached");

    let cancel = CancellationToken::new();
    let reader_cancel = cancel.clone();
    let session_name = session.to_string();
    let pane = target_pane.to_string();

    let task = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        // Lines already read during attach confirmation come first.
        let mut pending = banner;

        'outer: loop {
            for line in pending.drain(..) {
                match parse_line(&line) {
                    ControlLine::Output { pane: p, data } if p == pane => {
                        injector.stdout(data, true);
                    }
                    ControlLine::Exit => {
                        debug!(session = session_name, "control channel %exit");
                        break 'outer;
                    }
                    _ => {}
                }
            }
            if reader_cancel.is_cancelled() {
                break;
            }
            match pty.poll_readable(200) {
                Ok(false) => {
                    if pty.try_wait() {
                        debug!(session = session_name, "control client exited");
                        break;
                    }
                }
                Ok(true) => {
                    let n = match pty.read(&mut buf) {
                        Ok(n) => n,
                        Err(e) => {
                            warn!(session = session_name, error = %e, "control channel read failed");
                            injector.error(format!("control channel read: {e}"));
                            break;
                        }
                    };
                    if n == 0 {
                        if pty.try_wait() {
                            break;
                        }
                        // POLLHUP with nothing to read; avoid a busy loop.
                        std::thread::sleep(Duration::from_millis(50));
                        continue;
                    }
                    pending = lines.feed(&buf[..n]);
                }
                Err(e) => {
                    injector.error(format!("control channel poll: {e}"));
                    break;
                }
            }
        }
        // Detach promptly instead of leaving the client attached until the
        // process table drops it; Drop still reaps.
        let _ = pty.terminate();
    });

    Ok(Transport::new(cancel, vec![task]))
}

/// Wait for the control client to prove the attach succeeded.
///
/// A successful client prints its `%begin`/`%end` banner right away; a
/// failing one prints an error and exits. Returns the lines read so far so
/// the reader loop can replay them.
fn confirm_attach(pty: &PtyChild, lines: &mut LineBuffer) -> Result<Vec<String>, VigilError> {
    let deadline = Instant::now() + ATTACH_CONFIRM_TIMEOUT;
    let mut buf = [0u8; 4096];
    let mut seen: Vec<String> = Vec::new();

    while Instant::now() < deadline {
        if !pty.poll_readable(100)? {
            if pty.try_wait() {
                return Err(VigilError::Transport(
                    "control client exited before confirming the attach".into(),
                ));
            }
            continue;
        }

        let n = pty.read(&mut buf)?;
        if n == 0 {
            if pty.try_wait() {
                return Err(VigilError::Transport(
                    "control client exited before confirming the attach".into(),
                ));
            }
            std::thread::sleep(Duration::from_millis(20));
            continue;
        }

        seen.extend(lines.feed(&buf[..n]));
        if seen.iter().any(|l| l.starts_with("%begin")) {
            return Ok(seen);
        }
        if seen.iter().any(|l| parse_line(l) == ControlLine::Exit) {
            return Err(VigilError::Transport(
                "control client refused the attach".into(),
            ));
        }
    }
    Err(VigilError::Transport(
        "no control-mode banner before timeout".into(),
    ))
}
