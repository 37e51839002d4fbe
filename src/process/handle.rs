//! Ownership wrapper around a spawned child process.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// How long the stream pumps get to drain after the child exits, or to wind
/// down after being detached.
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt as _;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Receives every chunk read from the child's stdout/stderr, in arrival order.
pub type ChunkCallback = Arc<dyn Fn(StreamKind, &str) + Send + Sync>;

/// Runs once after the child has exited and its streams have drained.
pub type ExitCallback = Box<dyn FnOnce(ExitInfo) + Send>;

/// A spawned child.
///
/// The stdout/stderr pipes are owned by pump tasks until [`detach_streams`] drops
/// them. A background task owns the [`Child`] itself, reaps it and publishes the
/// exit status. Dropping the handle while the child is alive kills the child.
///
/// [`detach_streams`]: ProcessHandle::detach_streams
pub struct ProcessHandle {
    pid: u32,
    label: String,
    pumps: Vec<JoinHandle<()>>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("label", &self.label)
            .field("exit", &self.exit_info())
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// Spawn `cmd` with stdin closed and stdout/stderr piped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        mut cmd: Command,
        label: &str,
        on_chunk: ChunkCallback,
        on_exit: ExitCallback,
    ) -> std::io::Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("child exited before its pid was read"))?;

        // Every pump holds a sender; the channel closes once all pipes are dropped.
        let (drained_tx, drained_rx) = mpsc::channel(1);
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(
                PumpSource {
                    reader: stdout,
                    _drained: drained_tx.clone(),
                },
                StreamKind::Stdout,
                Arc::clone(&on_chunk),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(
                PumpSource {
                    reader: stderr,
                    _drained: drained_tx.clone(),
                },
                StreamKind::Stderr,
                Arc::clone(&on_chunk),
            )));
        }
        drop(drained_tx);

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let aborts = pumps.iter().map(JoinHandle::abort_handle).collect();

        tokio::spawn(watch_exit(
            child,
            format!("{} (pid {})", label, pid),
            kill_rx,
            exit_tx,
            aborts,
            drained_rx,
            on_exit,
        ));

        Ok(Self {
            pid,
            label: label.to_string(),
            pumps,
            kill_tx: Some(kill_tx),
            exit_rx,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Drop the stdout/stderr pipes so no descriptor of ours stays open on them.
    ///
    /// Returns once the pump tasks are gone, so the pipes are closed by then.
    pub async fn detach_streams(&mut self) {
        if self.pumps.is_empty() {
            return;
        }
        for pump in &self.pumps {
            pump.abort();
        }
        let pumps = std::mem::take(&mut self.pumps);
        if tokio::time::timeout(STREAM_DRAIN_TIMEOUT, join_all(pumps))
            .await
            .is_err()
        {
            log::warn!("Output pumps of {} did not stop in time", self.label);
        }
    }

    /// Ask the exit task to forcefully kill the child. Returns `false` if a kill
    /// was already requested or the child has already been reaped.
    pub fn request_kill(&mut self) -> bool {
        self.kill_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    /// Wait for the exit event, but no longer than `ceiling`.
    pub async fn wait_exit(&self, ceiling: Duration) -> Option<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        let exit = match tokio::time::timeout(ceiling, rx.wait_for(Option::is_some)).await {
            Ok(Ok(info)) => *info,
            Ok(Err(_)) => self.exit_info(),
            Err(_) => None,
        };
        exit
    }

    /// Handle whose exit is driven by the test through the returned sender.
    #[cfg(test)]
    pub(crate) fn stub(
        pid: u32,
        label: &str,
    ) -> (
        Self,
        watch::Sender<Option<ExitInfo>>,
        oneshot::Receiver<()>,
    ) {
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = Self {
            pid,
            label: label.to_string(),
            pumps: Vec::new(),
            kill_tx: Some(kill_tx),
            exit_rx,
        };
        (handle, exit_tx, kill_rx)
    }
}

async fn watch_exit(
    mut child: Child,
    label: String,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    pumps: Vec<AbortHandle>,
    mut drained: mpsc::Receiver<()>,
    on_exit: ExitCallback,
) {
    // A dropped sender counts as a kill request.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                log::warn!("Failed to kill {}: {}", label, e);
            }
            child.wait().await
        }
    };

    let info = match status {
        Ok(status) => ExitInfo::from_status(status),
        Err(e) => {
            log::error!("Failed to wait for {}: {}", label, e);
            ExitInfo::unknown()
        }
    };
    exit_tx.send_replace(Some(info));

    // Nothing is ever sent; `recv` yields `None` once every pump has dropped its pipe.
    if tokio::time::timeout(STREAM_DRAIN_TIMEOUT, drained.recv())
        .await
        .is_err()
    {
        // A grandchild still holds the pipes open.
        log::debug!("Output of {} did not drain, detaching", label);
        for pump in pumps {
            pump.abort();
        }
    }

    on_exit(info);
}

/// A pipe plus the drain marker. Fields drop in order, so the pipe is closed
/// before the marker reports it.
struct PumpSource<R> {
    reader: R,
    _drained: mpsc::Sender<()>,
}

async fn pump<R>(mut source: PumpSource<R>, kind: StreamKind, on_chunk: ChunkCallback)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut pending = Vec::new();
    loop {
        match source.reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = decode_chunk(&mut pending, &buf[..n]);
                if !text.is_empty() {
                    on_chunk(kind, &text);
                }
            }
        }
    }
    if !pending.is_empty() {
        on_chunk(kind, &String::from_utf8_lossy(&pending));
    }
}

/// Decode `bytes` as UTF-8, carrying an incomplete trailing sequence over to the
/// next chunk in `pending`.
fn decode_chunk(pending: &mut Vec<u8>, bytes: &[u8]) -> String {
    pending.extend_from_slice(bytes);
    let checked = std::str::from_utf8(&pending[..]).map(str::len);
    let valid = match checked {
        Ok(len) => len,
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            return text;
        }
    };
    let rest = pending.split_off(valid);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    text
}
