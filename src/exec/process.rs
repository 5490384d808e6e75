use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { stream: StreamKind, data: Vec<u8> },
    Exited { code: Option<i32>, signal: Option<i32> },
    Error(String),
}

impl ProcessEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Output { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Spawned,
    Exited { code: Option<i32>, signal: Option<i32> },
    Failed(String),
}

/// One spawned program with piped stdin/stdout/stderr
///
/// A supervisor task owns the child and both output pipes. It forwards output
/// chunks in per-stream order and finishes with exactly one terminal event.
/// Dropping the handle kills the process.
pub struct ProcessHandle {
    pid: Option<u32>,
    stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
    kill: CancellationToken,
    status: Arc<Mutex<ProcessStatus>>,
    finished: bool,
}

impl ProcessHandle {
    /// Spawns `artifact_path`. `drain_grace` bounds how long leftover output is
    /// read after the process itself has exited.
    pub fn spawn(artifact_path: &Path, drain_grace: Duration) -> Result<Self> {
        let mut cmd = Command::new(artifact_path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = artifact_path.parent() {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Unable to execute {}", artifact_path.display()))?;
        let pid = child.id();

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();
        let status = Arc::new(Mutex::new(ProcessStatus::Spawned));

        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(feed_stdin(stdin, stdin_rx));
        }
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::spawn(supervise(
            child,
            pid,
            stdout,
            stderr,
            events_tx,
            kill.clone(),
            status.clone(),
            drain_grace,
        ));

        Ok(Self {
            pid,
            stdin: Some(stdin_tx),
            events: events_rx,
            kill,
            status,
            finished: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> ProcessStatus {
        self.status.lock().clone()
    }

    pub fn is_alive(&self) -> bool {
        matches!(*self.status.lock(), ProcessStatus::Spawned)
    }

    /// Queues bytes for the program's stdin. Silently dropped once the process
    /// is gone or stdin was closed.
    pub fn write(&self, bytes: impl Into<Vec<u8>>) {
        if !self.is_alive() {
            return;
        }
        if let Some(stdin) = &self.stdin {
            let _ = stdin.send(bytes.into());
        }
    }

    /// Closes stdin after everything queued so far has been written
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Forcibly terminates the process; safe to call any number of times
    pub fn close(&self) {
        self.kill.cancel();
    }

    /// Next output chunk or the terminal event. Returns `None` once the
    /// terminal event has been handed out.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        if self.finished {
            return None;
        }
        let event = match self.events.recv().await {
            Some(event) => event,
            None => {
                let reason = "process supervisor stopped unexpectedly".to_string();
                *self.status.lock() = ProcessStatus::Failed(reason.clone());
                ProcessEvent::Error(reason)
            }
        };
        if event.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

async fn feed_stdin(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        let written = match stdin.write_all(&bytes).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            log::debug!("Stdin closed by process: {e}");
            return;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    mut stdout: Option<ChildStdout>,
    mut stderr: Option<ChildStderr>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    kill: CancellationToken,
    status: Arc<Mutex<ProcessStatus>>,
    drain_grace: Duration,
) {
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let mut exit: Option<std::io::Result<ExitStatus>> = None;
    let mut drain_deadline = Instant::now();
    let mut killed = false;
    let leader = async move {
        match pid {
            Some(pid) => leader_exited(pid).await,
            None => Ok(()),
        }
    };
    tokio::pin!(leader);

    loop {
        if exit.is_some() && stdout.is_none() && stderr.is_none() {
            break;
        }
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf) => {
                forward(read, StreamKind::Stdout, &mut stdout, &out_buf, &events);
            }
            read = read_chunk(&mut stderr, &mut err_buf) => {
                forward(read, StreamKind::Stderr, &mut stderr, &err_buf, &events);
            }
            waited = &mut leader, if exit.is_none() => {
                match (waited, pid) {
                    // the unreaped leader still holds the group id, so only its
                    // own leftovers can be hit
                    (Ok(()), Some(pid)) => kill_process_group(pid),
                    (Ok(()), None) => {}
                    (Err(e), _) => log::debug!("Unable to observe exit of process {pid:?}: {e}"),
                }
                exit = Some(child.wait().await);
                drain_deadline = Instant::now() + drain_grace;
            }
            _ = kill.cancelled(), if exit.is_none() && !killed => {
                killed = true;
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                if let Err(e) = child.start_kill() {
                    log::debug!("Process {pid:?} already exited: {e}");
                }
            }
            _ = sleep_until(drain_deadline), if exit.is_some() => {
                log::debug!("Output of process {pid:?} still open after exit, giving up on it");
                break;
            }
        }
    }

    let Some(exit) = exit else {
        return;
    };
    let (event, final_status) = match exit {
        Ok(exit_status) => {
            let code = exit_status.code();
            let signal = exit_signal(&exit_status);
            (
                ProcessEvent::Exited { code, signal },
                ProcessStatus::Exited { code, signal },
            )
        }
        Err(e) => {
            let reason = format!("unable to wait for process: {e}");
            (ProcessEvent::Error(reason.clone()), ProcessStatus::Failed(reason))
        }
    };
    *status.lock() = final_status;
    let _ = events.send(event);
}

/// Reads one chunk; pending forever once the stream is closed
async fn read_chunk<R: tokio::io::AsyncRead + Unpin>(
    stream: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match stream {
        Some(stream) => stream.read(buf).await,
        None => std::future::pending().await,
    }
}

fn forward<R>(
    read: std::io::Result<usize>,
    kind: StreamKind,
    stream: &mut Option<R>,
    buf: &[u8],
    events: &mpsc::UnboundedSender<ProcessEvent>,
) {
    match read {
        Ok(0) => *stream = None,
        Ok(n) => {
            let _ = events.send(ProcessEvent::Output {
                stream: kind,
                data: buf[..n].to_vec(),
            });
        }
        Err(e) => {
            log::debug!("Stopped reading {kind:?}: {e}");
            *stream = None;
        }
    }
}

/// Resolves once `pid` has exited, leaving it unreaped
async fn leader_exited(pid: u32) -> std::io::Result<()> {
    let waited = tokio::task::spawn_blocking(move || {
        loop {
            // SAFETY: `info` is a plain out-parameter owned by this frame
            let rc = unsafe {
                let mut info: libc::siginfo_t = std::mem::zeroed();
                libc::waitid(
                    libc::P_PID,
                    pid as libc::id_t,
                    &mut info,
                    libc::WEXITED | libc::WNOWAIT,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    })
    .await;
    waited.map_err(std::io::Error::other)?
}

/// Sends SIGKILL to the process group led by `pid`, reaching anything the
/// program or build tool forked
pub(super) fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        if rc != 0 {
            log::debug!(
                "kill(-{pid}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Human readable name of a termination signal
pub fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGKILL => "SIGKILL",
        libc::SIGTERM => "SIGTERM",
        libc::SIGINT => "SIGINT",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGABRT => "SIGABRT",
        libc::SIGFPE => "SIGFPE",
        libc::SIGILL => "SIGILL",
        libc::SIGHUP => "SIGHUP",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGBUS => "SIGBUS",
        _ => return format!("signal {signal}"),
    };
    name.to_string()
}
