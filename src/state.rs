use std::sync::Arc;

use crate::auth::{AuthClient, GoTrueClient, MemoryAuth};
use crate::config::Config;
use crate::repository::QuizRepository;
use crate::runs::RunStore;
use crate::session::{AuthContext, SessionRecord, SessionStore};
use crate::store::{MemoryStore, PostgrestClient, QueryClient};

#[derive(Clone)]
pub struct AppState {
    pub repo: QuizRepository,
    pub auth: Arc<dyn AuthClient>,
    pub sessions: Arc<SessionStore>,
    pub runs: Arc<RunStore>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn QueryClient>, auth: Arc<dyn AuthClient>) -> Self {
        Self {
            repo: QuizRepository::new(store),
            auth,
            sessions: Arc::new(SessionStore::new()),
            runs: Arc::new(RunStore::new()),
            config: Arc::new(config),
        }
    }

    /// Picks the hosted backend or the in-process one from `config.store_url`.
    pub fn from_config(config: Config) -> Self {
        if config.uses_memory_store() {
            tracing::warn!("using in-memory store and auth; data is lost on restart");
            Self::new(config, Arc::new(MemoryStore::new()), Arc::new(MemoryAuth::new()))
        } else {
            let store = Arc::new(PostgrestClient::new(&config.store_url, &config.api_key));
            let auth = Arc::new(GoTrueClient::new(&config.store_url, &config.api_key));
            Self::new(config, store, auth)
        }
    }

    pub async fn session(&self, session_id: Option<&str>) -> Option<SessionRecord> {
        self.sessions.get(session_id?).await
    }

    pub async fn context(&self, session_id: Option<&str>) -> AuthContext {
        self.session(session_id)
            .await
            .map(|s| s.context())
            .unwrap_or_default()
    }
}
