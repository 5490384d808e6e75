use std::fmt;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Sleep, sleep};
use tokio_util::sync::CancellationToken;

use super::SessionState;
use super::protocol::{ClientEvent, ServerEvent, frame_line};
use crate::exec::{
    BuildResult, ExecEnv, ProcessEvent, ProcessHandle, RunWorkspace, StreamKind, signal_name,
};
use crate::source::SourceRef;

#[derive(Debug, Clone, Copy)]
enum KillReason {
    Inactivity,
    StoppedByUser,
    WallClock(Duration),
    Restarted,
    Disconnected,
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactivity => f.write_str("inactivity timeout"),
            Self::StoppedByUser => f.write_str("stopped by user"),
            Self::WallClock(limit) => write!(f, "{} second timeout", limit.as_secs()),
            Self::Restarted => f.write_str("restarted by new run"),
            Self::Disconnected => f.write_str("client disconnected"),
        }
    }
}

/// The one run a session may have in flight
struct ActiveRun {
    workspace: RunWorkspace,
    phase: Phase,
}

enum Phase {
    Building {
        task: JoinHandle<anyhow::Result<BuildResult>>,
        cancel: CancellationToken,
        initial_input: Option<String>,
    },
    Running(RunningProcess),
}

/// A live process plus the timers that only exist while it runs
struct RunningProcess {
    process: ProcessHandle,
    inactivity: Pin<Box<Sleep>>,
    inactivity_window: Duration,
    wall_clock: Option<(Pin<Box<Sleep>>, Duration)>,
    stdout: Utf8Stream,
    stderr: Utf8Stream,
}

impl RunningProcess {
    fn new(process: ProcessHandle, inactivity_window: Duration, wall_clock: Option<Duration>) -> Self {
        Self {
            process,
            inactivity: Box::pin(sleep(inactivity_window)),
            inactivity_window,
            wall_clock: wall_clock.map(|limit| (Box::pin(sleep(limit)), limit)),
            stdout: Utf8Stream::default(),
            stderr: Utf8Stream::default(),
        }
    }

    fn decode(&mut self, stream: StreamKind, data: &[u8]) -> String {
        match stream {
            StreamKind::Stdout => self.stdout.decode(data),
            StreamKind::Stderr => self.stderr.decode(data),
        }
    }

    /// Whatever incomplete sequences are left once the process has ended
    fn flush(&mut self) -> String {
        let mut text = self.stdout.flush();
        text.push_str(&self.stderr.flush());
        text
    }

    /// Pushes the inactivity deadline out after any process I/O
    fn touch(&mut self) {
        self.inactivity
            .as_mut()
            .reset(Instant::now() + self.inactivity_window);
    }
}

/// Decodes one output stream, holding back a multibyte character cut off at
/// the end of a read until its remaining bytes arrive
#[derive(Debug, Default)]
struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    fn decode(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);
        let mut text = String::new();
        let mut rest = &self.pending[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        text
    }

    fn flush(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned()
    }
}

enum Wakeup {
    Shutdown,
    Client(Option<ClientEvent>),
    Built(Result<anyhow::Result<BuildResult>, JoinError>),
    Process(Option<ProcessEvent>),
    Inactive,
    WallClock(Duration),
}

/// Owns all per-session state; runs until the client goes away or the session
/// is closed, then kills whatever is left and cleans up.
pub(super) struct SessionActor {
    id: String,
    env: Arc<ExecEnv>,
    inbound: mpsc::UnboundedReceiver<ClientEvent>,
    outbound: mpsc::UnboundedSender<ServerEvent>,
    state: watch::Sender<SessionState>,
    shutdown: CancellationToken,
    active: Option<ActiveRun>,
    runs: u64,
}

impl SessionActor {
    pub(super) fn new(
        id: String,
        env: Arc<ExecEnv>,
        inbound: mpsc::UnboundedReceiver<ClientEvent>,
        outbound: mpsc::UnboundedSender<ServerEvent>,
        state: watch::Sender<SessionState>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            env,
            inbound,
            outbound,
            state,
            shutdown,
            active: None,
            runs: 0,
        }
    }

    pub(super) async fn run(mut self) {
        log::info!("Session {} attached", self.id);

        loop {
            match self.next_wakeup().await {
                Wakeup::Shutdown
                | Wakeup::Client(None)
                | Wakeup::Client(Some(ClientEvent::Disconnect)) => break,
                Wakeup::Client(Some(ClientEvent::Run { source, input })) => {
                    self.start_run(source, input).await
                }
                Wakeup::Client(Some(ClientEvent::Input { text })) => self.relay_input(&text),
                Wakeup::Client(Some(ClientEvent::Stop)) => self.stop().await,
                Wakeup::Built(result) => self.on_built(result).await,
                Wakeup::Process(event) => self.on_process_event(event).await,
                Wakeup::Inactive => self.terminate(KillReason::Inactivity).await,
                Wakeup::WallClock(limit) => self.terminate(KillReason::WallClock(limit)).await,
            }
        }

        self.terminate(KillReason::Disconnected).await;
        self.set_state(SessionState::Closed);
        log::info!("Session {} closed after {} run(s)", self.id, self.runs);
    }

    async fn next_wakeup(&mut self) -> Wakeup {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Wakeup::Shutdown,
            _ = self.outbound.closed() => {
                log::info!("Session {}: client channel closed", self.id);
                Wakeup::Shutdown
            }
            event = self.inbound.recv() => Wakeup::Client(event),
            wakeup = poll_active(&mut self.active) => wakeup,
        }
    }

    async fn start_run(&mut self, source: SourceRef, input: Option<String>) {
        if self.active.is_some() {
            log::info!("Session {}: new run requested, terminating the current one", self.id);
            self.terminate(KillReason::Restarted).await;
        }

        self.runs += 1;
        let workspace = self.env.workspace();
        log::info!("Session {}: run {} building", self.id, workspace.run_id());
        self.emit(ServerEvent::output("Compiling...\n"));

        let env = self.env.clone();
        let source_path = workspace.source_path().to_path_buf();
        let artifact_path = workspace.artifact_path().to_path_buf();
        let cancel = CancellationToken::new();
        let build_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            env.prepare(&source, &source_path, &artifact_path, &build_cancel)
                .await
        });

        self.active = Some(ActiveRun {
            workspace,
            phase: Phase::Building {
                task,
                cancel,
                initial_input: input,
            },
        });
        self.set_state(SessionState::Building);
    }

    async fn on_built(&mut self, result: Result<anyhow::Result<BuildResult>, JoinError>) {
        let (workspace, initial_input) = match self.active.take() {
            Some(ActiveRun {
                workspace,
                phase: Phase::Building { initial_input, .. },
            }) => (workspace, initial_input),
            other => {
                self.active = other;
                return;
            }
        };
        let run_id = workspace.run_id();

        let artifact = match result {
            Ok(Ok(BuildResult::Artifact(path))) => path,
            Ok(Ok(BuildResult::Diagnostic(text))) => {
                log::info!("Session {}: run {run_id} failed to compile", self.id);
                return self
                    .finish(workspace, format!("Compilation failed:\n{text}\n"))
                    .await;
            }
            Ok(Err(e)) => {
                log::warn!("Session {}: run {run_id} source unavailable: {e:#}", self.id);
                return self
                    .finish(workspace, format!("Failed to prepare source: {e:#}\n"))
                    .await;
            }
            Err(e) => {
                log::error!("Session {}: build task of run {run_id} failed: {e}", self.id);
                return self
                    .finish(workspace, format!("Build task failed: {e}\n"))
                    .await;
            }
        };

        self.emit(ServerEvent::output("Compilation successful. Running...\n\n"));
        self.emit(ServerEvent::Compiled);

        let process = match self.env.spawn(&artifact) {
            Ok(process) => process,
            Err(e) => {
                log::warn!("Session {}: run {run_id} failed to start: {e:#}", self.id);
                return self
                    .finish(workspace, format!("Failed to start process: {e:#}\n"))
                    .await;
            }
        };
        log::info!(
            "Session {}: run {run_id} running as pid {:?}",
            self.id,
            process.pid()
        );

        let policy = &self.env.policy;
        let running = RunningProcess::new(
            process,
            policy.inactivity_timeout.as_duration(),
            policy.interactive_hard_timeout.map(|limit| limit.as_duration()),
        );
        if let Some(input) = initial_input {
            running.process.write(frame_line(&input));
        }

        self.active = Some(ActiveRun {
            workspace,
            phase: Phase::Running(running),
        });
        self.set_state(SessionState::Running);
    }

    fn relay_input(&mut self, text: &str) {
        match self.active.as_mut().map(|run| &mut run.phase) {
            Some(Phase::Running(running)) => {
                running.process.write(frame_line(text));
                running.touch();
            }
            _ => log::debug!("Session {}: input ignored, no running process", self.id),
        }
    }

    async fn on_process_event(&mut self, event: Option<ProcessEvent>) {
        match event {
            Some(ProcessEvent::Output { stream, data }) => {
                let text = match &mut self.active {
                    Some(ActiveRun {
                        phase: Phase::Running(running),
                        ..
                    }) => {
                        running.touch();
                        running.decode(stream, &data)
                    }
                    _ => String::from_utf8_lossy(&data).into_owned(),
                };
                self.emit_text(text);
            }
            Some(terminal) => {
                let Some(ActiveRun { workspace, phase }) = self.active.take() else {
                    return;
                };
                if let Phase::Running(mut running) = phase {
                    self.emit_text(running.flush());
                }
                log::info!(
                    "Session {}: run {} ended with {terminal:?}",
                    self.id,
                    workspace.run_id()
                );
                self.finish(workspace, describe_exit(&terminal)).await;
            }
            None => {}
        }
    }

    async fn stop(&mut self) {
        if self.active.is_none() {
            self.emit(ServerEvent::output("[No active process]\n"));
            return;
        }
        self.terminate(KillReason::StoppedByUser).await;
    }

    /// Kills the current build or process, waits until it is really gone,
    /// reports `reason` and cleans up. No-op without an active run.
    async fn terminate(&mut self, reason: KillReason) {
        let Some(ActiveRun { workspace, phase }) = self.active.take() else {
            return;
        };
        let run_id = workspace.run_id();

        let message = match phase {
            Phase::Building { task, cancel, .. } => {
                cancel.cancel();
                if let Err(e) = task.await {
                    log::error!("Session {}: build task of run {run_id} failed: {e}", self.id);
                }
                log::info!("Session {}: build of run {run_id} cancelled ({reason})", self.id);
                format!("\n[Build cancelled: {reason}]\n")
            }
            Phase::Running(mut running) => {
                self.set_state(SessionState::Terminating);
                running.process.close();
                while let Some(event) = running.process.next_event().await {
                    match event {
                        ProcessEvent::Output { stream, data } => {
                            let text = running.decode(stream, &data);
                            self.emit_text(text);
                        }
                        terminal => log::debug!(
                            "Session {}: run {run_id} reaped with {terminal:?}",
                            self.id
                        ),
                    }
                }
                self.emit_text(running.flush());
                log::info!("Session {}: run {run_id} killed ({reason})", self.id);
                format!("\n[Process killed: {reason}]\n")
            }
        };

        self.finish(workspace, message).await;
    }

    /// Terminal path shared by every run: last message, cleanup, then `done`
    async fn finish(&mut self, workspace: RunWorkspace, message: String) {
        self.emit(ServerEvent::output(message));
        self.env.cleaner.cleanup_run(workspace).await;
        self.set_state(SessionState::Idle);
        self.emit(ServerEvent::Done);
    }

    fn emit(&self, event: ServerEvent) {
        if self.outbound.send(event).is_err() {
            log::debug!("Session {}: client gone, event dropped", self.id);
        }
    }

    /// Output text; empty when a read ended mid-character
    fn emit_text(&self, text: String) {
        if !text.is_empty() {
            self.emit(ServerEvent::output(text));
        }
    }

    fn set_state(&self, state: SessionState) {
        log::debug!("Session {} -> {state}", self.id);
        self.state.send_replace(state);
    }
}

/// Waits on whatever the active run is doing; never resolves when idle
async fn poll_active(active: &mut Option<ActiveRun>) -> Wakeup {
    let Some(run) = active else {
        return pending().await;
    };

    match &mut run.phase {
        Phase::Building { task, .. } => Wakeup::Built(task.await),
        Phase::Running(RunningProcess {
            process,
            inactivity,
            wall_clock,
            ..
        }) => {
            let wall_clock = async move {
                match wall_clock {
                    Some((deadline, limit)) => {
                        deadline.await;
                        *limit
                    }
                    None => pending().await,
                }
            };
            tokio::select! {
                event = process.next_event() => Wakeup::Process(event),
                _ = inactivity => Wakeup::Inactive,
                limit = wall_clock => Wakeup::WallClock(limit),
            }
        }
    }
}

fn describe_exit(event: &ProcessEvent) -> String {
    match event {
        ProcessEvent::Exited {
            code: Some(code), ..
        } => format!("\n[Process exited with code {code}]\n"),
        ProcessEvent::Exited {
            signal: Some(signal),
            ..
        } => format!("\n[Process terminated by signal {}]\n", signal_name(*signal)),
        ProcessEvent::Exited { .. } => "\n[Process exited]\n".to_string(),
        ProcessEvent::Error(reason) => format!("\nProcess error: {reason}\n"),
        ProcessEvent::Output { .. } => String::new(),
    }
}
