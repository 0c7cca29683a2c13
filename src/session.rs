use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

use crate::auth::AuthUser;
use crate::error::RepoError;

pub const SESSION_COOKIE: &str = "quiz_session";
pub const CSRF_COOKIE: &str = "csrf_token";
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Identity handed explicitly to every repository call.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub user: Option<AuthUser>,
    pub access_token: Option<String>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn signed_in(user: AuthUser, access_token: impl Into<String>) -> Self {
        Self {
            user: Some(user),
            access_token: Some(access_token.into()),
        }
    }

    pub fn require_user(&self) -> Result<&AuthUser, RepoError> {
        self.user.as_ref().ok_or(RepoError::Unauthenticated)
    }

    pub fn token(&self) -> Option<String> {
        self.access_token.clone()
    }

    pub fn user_id(&self) -> Option<uuid::Uuid> {
        self.user.as_ref().map(|u| u.id)
    }
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub user: AuthUser,
    pub access_token: String,
    pub csrf_token: String,
}

impl SessionRecord {
    pub fn context(&self) -> AuthContext {
        AuthContext::signed_in(self.user.clone(), self.access_token.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(AuthUser),
    SignedOut(AuthUser),
}

/// Browser sessions keyed by the session cookie value. Identity changes are
/// published to subscribers as [`AuthEvent`]s.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    events: broadcast::Sender<AuthEvent>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Returns the new session id.
    pub async fn sign_in(&self, record: SessionRecord) -> String {
        let session_id = uuid::Uuid::new_v4().to_string();
        let user = record.user.clone();
        self.sessions.write().await.insert(session_id.clone(), record);
        // no receivers is fine
        let _ = self.events.send(AuthEvent::SignedIn(user));
        session_id
    }

    pub async fn sign_out(&self, session_id: &str) -> Option<SessionRecord> {
        let removed = self.sessions.write().await.remove(session_id);
        if let Some(record) = &removed {
            let _ = self.events.send(AuthEvent::SignedOut(record.user.clone()));
        }
        removed
    }
}

/// Logs identity changes until the store is dropped.
pub fn spawn_event_log(store: &SessionStore) -> tokio::task::JoinHandle<()> {
    let mut events = store.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(AuthEvent::SignedIn(user)) => tracing::info!(user_id = %user.id, "signed in"),
                Ok(AuthEvent::SignedOut(user)) => tracing::info!(user_id = %user.id, "signed out"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "auth event log lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
