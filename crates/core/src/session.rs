use crate::engine::RetrievalEngine;
use crate::error::ChatError;
use crate::models::Turn;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

pub type SessionId = Uuid;

/// One isolated conversation: its own history and optionally its own index.
#[derive(Clone)]
pub struct Session {
    id: SessionId,
    label: String,
    created_at: DateTime<Utc>,
    history: Vec<Turn>,
    engine: Option<Arc<RetrievalEngine>>,
}

impl Session {
    fn new(label: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            label,
            created_at: Utc::now(),
            history: Vec::new(),
            engine: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn engine(&self) -> Option<&Arc<RetrievalEngine>> {
        self.engine.as_ref()
    }

    /// Appends one user turn followed by one assistant turn.
    pub(crate) fn record_exchange(&mut self, utterance: &str, reply: &str) {
        self.history.push(Turn::user(utterance));
        self.history.push(Turn::assistant(reply));
    }

    pub(crate) fn history_mut(&mut self) -> &mut Vec<Turn> {
        &mut self.history
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("turns", &self.history.len())
            .field("bound", &self.engine.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

pub type SessionHandle = Arc<AsyncMutex<Session>>;

#[derive(Clone)]
struct Entry {
    id: SessionId,
    label: String,
    created_at: DateTime<Utc>,
    session: SessionHandle,
}

struct RegistryState {
    entries: Vec<Entry>,
    active: SessionId,
    shared_engine: Option<Arc<RetrievalEngine>>,
    created: usize,
}

/// Owns every session of the process. Registry bookkeeping sits behind one
/// mutex; each session has its own async lock held for the length of a turn.
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Starts with a single default session, which is active.
    pub fn new() -> Self {
        let first = Session::new("Session 1".to_string());
        let entry = Entry {
            id: first.id,
            label: first.label.clone(),
            created_at: first.created_at,
            session: Arc::new(AsyncMutex::new(first)),
        };
        Self {
            state: Mutex::new(RegistryState {
                active: entry.id,
                entries: vec![entry],
                shared_engine: None,
                created: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_session(&self) -> SessionId {
        let mut state = self.lock();
        state.created += 1;
        let session = Session::new(format!("Session {}", state.created));
        let id = session.id;
        state.entries.push(Entry {
            id,
            label: session.label.clone(),
            created_at: session.created_at,
            session: Arc::new(AsyncMutex::new(session)),
        });
        id
    }

    /// Sessions in creation order.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let state = self.lock();
        state
            .entries
            .iter()
            .map(|entry| SessionSummary {
                id: entry.id,
                label: entry.label.clone(),
                created_at: entry.created_at,
                active: entry.id == state.active,
            })
            .collect()
    }

    pub fn switch(&self, id: SessionId) -> Result<(), ChatError> {
        let mut state = self.lock();
        if !state.entries.iter().any(|entry| entry.id == id) {
            return Err(ChatError::UnknownSession(id.to_string()));
        }
        state.active = id;
        Ok(())
    }

    pub fn active_id(&self) -> SessionId {
        self.lock().active
    }

    pub fn session(&self, id: SessionId) -> Result<SessionHandle, ChatError> {
        self.lock()
            .entries
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.session.clone())
            .ok_or_else(|| ChatError::UnknownSession(id.to_string()))
    }

    pub fn active_session(&self) -> (SessionId, SessionHandle) {
        let state = self.lock();
        let handle = state
            .entries
            .iter()
            .find(|entry| entry.id == state.active)
            .map(|entry| entry.session.clone());
        match handle {
            Some(handle) => (state.active, handle),
            // the active id always names a live entry; fall back to the first
            None => (state.entries[0].id, state.entries[0].session.clone()),
        }
    }

    /// Binds `engine` to one session and returns the engine it replaces.
    /// Waits for any turn in flight on that session to finish first.
    pub async fn bind_index(
        &self,
        id: SessionId,
        engine: Arc<RetrievalEngine>,
    ) -> Result<Option<Arc<RetrievalEngine>>, ChatError> {
        let handle = self.session(id)?;
        let previous = handle.lock().await.engine.replace(engine);
        Ok(previous)
    }

    /// Replaces the registry-wide engine used by sessions without their own,
    /// returning the one it replaces.
    pub fn bind_shared(&self, engine: Arc<RetrievalEngine>) -> Option<Arc<RetrievalEngine>> {
        self.lock().shared_engine.replace(engine)
    }

    pub fn shared_engine(&self) -> Option<Arc<RetrievalEngine>> {
        self.lock().shared_engine.clone()
    }

    /// The engine a turn on `session` should use: its own, else the shared one.
    pub fn engine_for(&self, session: &Session) -> Option<Arc<RetrievalEngine>> {
        session.engine.clone().or_else(|| self.shared_engine())
    }

    pub async fn history(&self, id: SessionId) -> Result<Vec<Turn>, ChatError> {
        let handle = self.session(id)?;
        let session = handle.lock().await;
        Ok(session.history.clone())
    }
}
