mod actor;
mod protocol;

pub use protocol::{ClientEvent, ServerEvent, frame_line};

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::exec::ExecEnv;
use actor::SessionActor;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Building,
    Running,
    Terminating,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Building => "building",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Handle to the task that serves one client connection
///
/// All run/input/stop handling happens inside that task, one event at a time;
/// the handle only posts events and observes state.
pub struct Session {
    id: String,
    connected_at: String,
    inbound: mpsc::UnboundedSender<ClientEvent>,
    state: watch::Receiver<SessionState>,
    shutdown: CancellationToken,
}

impl Session {
    /// Spawns the session task. Everything the session reports goes to `outbound`.
    pub fn start(
        id: impl Into<String>,
        env: Arc<ExecEnv>,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    ) -> Arc<Self> {
        let id = id.into();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let shutdown = CancellationToken::new();

        let actor = SessionActor::new(
            id.clone(),
            env,
            inbound_rx,
            outbound,
            state_tx,
            shutdown.clone(),
        );
        tokio::spawn(actor.run());

        Arc::new(Self {
            id,
            connected_at: crate::create_timestamp(),
            inbound: inbound_tx,
            state: state_rx,
            shutdown,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connected_at(&self) -> &str {
        &self.connected_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Posts an event to the session; returns `false` if the session has ended
    pub fn send(&self, event: ClientEvent) -> bool {
        self.inbound.send(event).is_ok()
    }

    /// Asks the session to kill its process, clean up and close. Does not wait.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once the session reached `Closed`
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
