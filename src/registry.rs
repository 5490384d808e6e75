use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::exec::ExecEnv;
use crate::session::{ServerEvent, Session, SessionState};

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub connected_at: String,
}

/// Live sessions keyed by connection id
///
/// The only structure touched by more than one connection; every mutation
/// happens under one lock.
pub struct SessionRegistry {
    env: Arc<ExecEnv>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(env: Arc<ExecEnv>) -> Self {
        Self {
            env,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the session bound to `connection_id`, starting one if needed.
    /// `outbound` is only used when a new session is started.
    pub fn attach(
        &self,
        connection_id: &str,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    ) -> Arc<Session> {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(connection_id) {
            return session.clone();
        }

        let session = Session::start(connection_id, self.env.clone(), outbound);
        sessions.insert(connection_id.to_string(), session.clone());
        log::debug!("Registry holds {} session(s)", sessions.len());
        session
    }

    /// Closes and removes the session. Closing kills any live process; the
    /// session finishes its cleanup in the background. Await
    /// [`Session::closed`] on the returned handle to wait for it.
    pub fn detach(&self, connection_id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get(connection_id)?.clone();
        session.close();
        sessions.remove(connection_id);
        log::info!("Session {connection_id} detached");
        Some(session)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(connection_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .lock()
            .values()
            .map(|s| SessionInfo {
                id: s.id().to_string(),
                state: s.state(),
                connected_at: s.connected_at().to_string(),
            })
            .collect();
        infos.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        infos
    }

    /// Detaches every session, e.g. on server shutdown
    pub fn close_all(&self) -> Vec<Arc<Session>> {
        let drained: Vec<Arc<Session>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
        }
        if !drained.is_empty() {
            log::info!("Closed {} session(s)", drained.len());
        }
        drained
    }
}
