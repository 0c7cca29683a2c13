use anyhow::{bail, Context};

pub const MEMORY_STORE_URL: &str = "memory://";

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the hosted backend, or `memory://` for the in-process one.
    pub store_url: String,
    pub api_key: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`; missing store URL or key is fatal.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let required = |key: &str| -> anyhow::Result<String> {
            match lookup(key).filter(|v| !v.trim().is_empty()) {
                Some(v) => Ok(v.trim().to_string()),
                None => bail!("missing required environment variable {key}"),
            }
        };
        let store_url = required("SUPABASE_URL")?;
        let api_key = required("SUPABASE_ANON_KEY")?;
        let host = lookup("BACKEND_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = match lookup("BACKEND_PORT") {
            Some(raw) => raw.parse().with_context(|| format!("invalid BACKEND_PORT {raw:?}"))?,
            None => 8080,
        };
        let cors_origins = lookup("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Ok(Self {
            store_url,
            api_key,
            host,
            port,
            cors_origins,
        })
    }

    /// In-process backend, for tests and local runs.
    pub fn in_memory() -> Self {
        Self {
            store_url: MEMORY_STORE_URL.to_string(),
            api_key: "local".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            cors_origins: vec!["http://localhost:5173".to_string()],
        }
    }

    pub fn uses_memory_store(&self) -> bool {
        self.store_url == MEMORY_STORE_URL
    }
}
