use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use http::StatusCode;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::RepoError;

/// Identity issued by the auth subsystem. Read-only here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthUser {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub user: AuthUser,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid login credentials")]
    InvalidCredentials,
    #[error("User already registered")]
    AlreadyRegistered,
    #[error("invalid or expired access token")]
    InvalidToken,
    #[error("{0}")]
    Rejected(String),
    #[error("request to auth service failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl From<AuthError> for RepoError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidToken => RepoError::Unauthenticated,
            other => RepoError::Persistence(other.to_string()),
        }
    }
}

#[async_trait]
pub trait AuthClient: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, AuthError>;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthSession, AuthError>;

    async fn get_user(&self, access_token: &str) -> Result<AuthUser, AuthError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError>;
}

#[derive(Debug, Deserialize)]
struct GoTrueErrorBody {
    msg: Option<String>,
    message: Option<String>,
    error_description: Option<String>,
}

/// Signup answers either with the user itself or with a session wrapping it,
/// depending on whether email confirmation is enabled.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session { user: AuthUser },
    User(AuthUser),
}

/// GoTrue auth API of the hosted backend (`{base_url}/auth/v1`).
#[derive(Clone)]
pub struct GoTrueClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GoTrueClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    async fn rejection(response: reqwest::Response) -> AuthError {
        let status = response.status();
        let body = response.json::<GoTrueErrorBody>().await.ok();
        let message = body
            .and_then(|b| b.msg.or(b.message).or(b.error_description))
            .unwrap_or_else(|| status.to_string());
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AuthError::InvalidToken,
            _ if message.contains("already registered") => AuthError::AlreadyRegistered,
            _ if message.contains("Invalid login credentials") => AuthError::InvalidCredentials,
            _ => AuthError::Rejected(message),
        }
    }
}

#[async_trait]
impl AuthClient for GoTrueClient {
    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, AuthError> {
        let response = self
            .http
            .post(self.url("signup"))
            .header("apikey", &self.api_key)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        Ok(match response.json::<SignUpResponse>().await? {
            SignUpResponse::Session { user } => user,
            SignUpResponse::User(user) => user,
        })
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let response = self
            .http
            .post(self.url("token"))
            .query(&[("grant_type", "password")])
            .header("apikey", &self.api_key)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        Ok(response.json::<AuthSession>().await?)
    }

    async fn get_user(&self, access_token: &str) -> Result<AuthUser, AuthError> {
        let response = self
            .http
            .get(self.url("user"))
            .header("apikey", &self.api_key)
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        Ok(response.json::<AuthUser>().await?)
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError> {
        let response = self
            .http
            .post(self.url("logout"))
            .header("apikey", &self.api_key)
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        Ok(())
    }
}

struct StoredAccount {
    user: AuthUser,
    password_hash: String,
}

/// In-process auth for tests and `memory://` mode.
#[derive(Clone, Default)]
pub struct MemoryAuth {
    accounts: Arc<RwLock<HashMap<String, StoredAccount>>>,
    tokens: Arc<RwLock<HashMap<String, AuthUser>>>,
}

impl MemoryAuth {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthClient for MemoryAuth {
    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, AuthError> {
        let email = email.trim().to_lowercase();
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(&email) {
            return Err(AuthError::AlreadyRegistered);
        }
        let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AuthError::Rejected(format!("password hash failed: {e}")))?
            .to_string();
        let user = AuthUser {
            id: Uuid::new_v4(),
            email: Some(email.clone()),
        };
        accounts.insert(
            email,
            StoredAccount {
                user: user.clone(),
                password_hash,
            },
        );
        Ok(user)
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let email = email.trim().to_lowercase();
        let user = {
            let accounts = self.accounts.read().await;
            let account = accounts.get(&email).ok_or(AuthError::InvalidCredentials)?;
            let parsed = PasswordHash::new(&account.password_hash)
                .map_err(|e| AuthError::Rejected(format!("bad hash: {e}")))?;
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .map_err(|_| AuthError::InvalidCredentials)?;
            account.user.clone()
        };
        let access_token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(48)
            .map(char::from)
            .collect();
        self.tokens.write().await.insert(access_token.clone(), user.clone());
        Ok(AuthSession { access_token, user })
    }

    async fn get_user(&self, access_token: &str) -> Result<AuthUser, AuthError> {
        self.tokens
            .read()
            .await
            .get(access_token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError> {
        self.tokens.write().await.remove(access_token);
        Ok(())
    }
}
