//! Single-process session store: a guarded mapping ID→Session. Kill
//! signaling is simply the session's own kill event; there is no
//! broadcast, since there is only one process to observe it.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::GatewayError;
use crate::session::{KillSignal, Session, SessionData};
use crate::store::{Predicate, SessionStore};

#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Session>, GatewayError> {
        Ok(self.sessions.read().get(id).cloned())
    }

    async fn put(&self, session: &Session) -> Result<(), GatewayError> {
        let id = session.id().await;
        self.sessions.write().insert(id, session.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), GatewayError> {
        self.sessions.write().remove(id);
        Ok(())
    }

    async fn list(&self, predicate: Predicate<'_>) -> Vec<SessionData> {
        let sessions: Vec<Session> = self.sessions.read().values().cloned().collect();
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions {
            let data = session.data().await;
            if predicate(&data) {
                out.push(data);
            }
        }
        out
    }

    async fn count(&self, predicate: Predicate<'_>) -> usize {
        self.list(predicate).await.len()
    }

    async fn get_kill_channel(&self, id: &str) -> KillSignal {
        let session = self.sessions.read().get(id).cloned();
        match session {
            Some(session) => session.kill_signal().await,
            None => KillSignal::new(),
        }
    }

    async fn publish_kill(&self, _id: &str) -> Result<(), GatewayError> {
        // Single process: the session's own kill signal is the only
        // observer-facing channel, already fired by `Session::kill`.
        Ok(())
    }
}
