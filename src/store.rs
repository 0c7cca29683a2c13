use chrono::{SecondsFormat, Utc};
use futures::future::BoxFuture;
use http::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::error::RepoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Quizzes,
    Questions,
    QuizAttempts,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Quizzes => "quizzes",
            Table::Questions => "questions",
            Table::QuizAttempts => "quiz_attempts",
        }
    }

    /// Columns the remote store fills in on insert.
    fn generated_timestamps(&self) -> &'static [&'static str] {
        match self {
            Table::Quizzes => &["created_at", "updated_at"],
            Table::Questions => &[],
            Table::QuizAttempts => &["completed_at"],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: &'static str,
    pub ascending: bool,
}

/// A related row pulled in alongside each result, keyed by `local_key`.
#[derive(Debug, Clone, PartialEq)]
pub struct Embed {
    pub table: Table,
    pub local_key: &'static str,
    pub columns: &'static [&'static str],
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: Table,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub embed: Option<Embed>,
}

impl Select {
    pub fn from(table: Table) -> Self {
        Self {
            table,
            filters: Vec::new(),
            order: None,
            embed: None,
        }
    }

    pub fn eq(mut self, column: &'static str, value: impl ToString) -> Self {
        self.filters.push(Filter {
            column,
            value: value.to_string(),
        });
        self
    }

    pub fn order(mut self, column: &'static str, ascending: bool) -> Self {
        self.order = Some(Order { column, ascending });
        self
    }

    pub fn embed(mut self, table: Table, local_key: &'static str, columns: &'static [&'static str]) -> Self {
        self.embed = Some(Embed {
            table,
            local_key,
            columns,
        });
        self
    }

    /// PostgREST query string parameters for this select.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let columns = match &self.embed {
            Some(embed) => format!("*,{}({})", embed.table.as_str(), embed.columns.join(",")),
            None => "*".to_string(),
        };
        let mut pairs = vec![("select".to_string(), columns)];
        pairs.extend(filter_pairs(&self.filters));
        if let Some(order) = &self.order {
            let direction = if order.ascending { "asc" } else { "desc" };
            pairs.push(("order".to_string(), format!("{}.{}", order.column, direction)));
        }
        pairs
    }
}

fn filter_pairs(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|f| (f.column.to_string(), format!("eq.{}", f.value)))
        .collect()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Rejected(String),
    /// The access token was refused, usually because it expired.
    #[error("{0}")]
    Unauthorized(String),
    #[error("request to data store failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected row shape: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<StoreError> for RepoError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unauthorized(_) => RepoError::Unauthenticated,
            other => RepoError::Persistence(other.to_string()),
        }
    }
}

/// Table-scoped access to the remote data store. `token` is the caller's
/// access token; without one requests run with the public key only.
pub trait QueryClient: Send + Sync {
    fn insert(
        &self,
        token: Option<String>,
        table: Table,
        rows: Vec<Value>,
    ) -> BoxFuture<'static, Result<Vec<Value>, StoreError>>;

    fn select(&self, token: Option<String>, query: Select) -> BoxFuture<'static, Result<Vec<Value>, StoreError>>;

    fn delete(
        &self,
        token: Option<String>,
        table: Table,
        filters: Vec<Filter>,
    ) -> BoxFuture<'static, Result<(), StoreError>>;
}

#[derive(Debug, Deserialize)]
struct PostgrestErrorBody {
    message: Option<String>,
    error: Option<String>,
}

async fn rejection(response: reqwest::Response) -> StoreError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<PostgrestErrorBody>(&text)
        .ok()
        .and_then(|b| b.message.or(b.error))
        .unwrap_or_else(|| if text.is_empty() { status.to_string() } else { text });
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized(message),
        _ => StoreError::Rejected(message),
    }
}

/// PostgREST data API of the hosted backend (`{base_url}/rest/v1`).
#[derive(Clone)]
pub struct PostgrestClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl PostgrestClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, table: Table, token: Option<&str>) -> reqwest::RequestBuilder {
        let url = format!("{}/rest/v1/{}", self.base_url, table.as_str());
        self.http
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(token.unwrap_or(self.api_key.as_str()))
    }
}

impl QueryClient for PostgrestClient {
    fn insert(
        &self,
        token: Option<String>,
        table: Table,
        rows: Vec<Value>,
    ) -> BoxFuture<'static, Result<Vec<Value>, StoreError>> {
        let request = self
            .request(reqwest::Method::POST, table, token.as_deref())
            .header("Prefer", "return=representation")
            .json(&rows);
        Box::pin(async move {
            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(rejection(response).await);
            }
            Ok(response.json::<Vec<Value>>().await?)
        })
    }

    fn select(&self, token: Option<String>, query: Select) -> BoxFuture<'static, Result<Vec<Value>, StoreError>> {
        let request = self
            .request(reqwest::Method::GET, query.table, token.as_deref())
            .query(&query.query_pairs());
        Box::pin(async move {
            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(rejection(response).await);
            }
            Ok(response.json::<Vec<Value>>().await?)
        })
    }

    fn delete(
        &self,
        token: Option<String>,
        table: Table,
        filters: Vec<Filter>,
    ) -> BoxFuture<'static, Result<(), StoreError>> {
        let request = self
            .request(reqwest::Method::DELETE, table, token.as_deref())
            .query(&filter_pairs(&filters));
        Box::pin(async move {
            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(rejection(response).await);
            }
            Ok(())
        })
    }
}

/// In-process stand-in for the data store, used by tests and `memory://`.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<HashMap<Table, Vec<Value>>>>,
    rejected_inserts: Arc<RwLock<HashSet<Table>>>,
    rejected_selects: Arc<RwLock<HashSet<Table>>>,
    tokens_expired: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following insert into `table` fail.
    pub async fn reject_inserts(&self, table: Table) {
        self.rejected_inserts.write().await.insert(table);
    }

    /// Makes every following select on `table` fail.
    pub async fn reject_selects(&self, table: Table) {
        self.rejected_selects.write().await.insert(table);
    }

    /// Refuses every request that carries an access token from now on.
    pub fn expire_tokens(&self) {
        self.tokens_expired.store(true, AtomicOrdering::SeqCst);
    }

    fn check_token(&self, token: &Option<String>) -> Result<(), StoreError> {
        if token.is_some() && self.tokens_expired.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Unauthorized("JWT expired".into()));
        }
        Ok(())
    }

    pub async fn rows(&self, table: Table) -> Vec<Value> {
        self.tables.read().await.get(&table).cloned().unwrap_or_default()
    }
}

fn matches(row: &Value, filters: &[Filter]) -> bool {
    filters.iter().all(|f| match row.get(f.column) {
        Some(Value::String(s)) => *s == f.value,
        Some(Value::Null) | None => false,
        Some(other) => other.to_string() == f.value,
    })
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn project(row: &Value, columns: &[&str]) -> Value {
    let mut out = Map::new();
    for column in columns {
        out.insert(column.to_string(), row.get(*column).cloned().unwrap_or(Value::Null));
    }
    Value::Object(out)
}

impl QueryClient for MemoryStore {
    fn insert(
        &self,
        token: Option<String>,
        table: Table,
        rows: Vec<Value>,
    ) -> BoxFuture<'static, Result<Vec<Value>, StoreError>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_token(&token)?;
            if store.rejected_inserts.read().await.contains(&table) {
                return Err(StoreError::Rejected(format!(
                    "new row violates row-level security policy for table \"{}\"",
                    table.as_str()
                )));
            }
            let mut inserted = Vec::with_capacity(rows.len());
            for row in rows {
                let Value::Object(mut fields) = row else {
                    return Err(StoreError::Rejected("row must be a JSON object".into()));
                };
                fields
                    .entry("id")
                    .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
                let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
                for column in table.generated_timestamps() {
                    fields
                        .entry(column.to_string())
                        .or_insert_with(|| Value::String(now.clone()));
                }
                inserted.push(Value::Object(fields));
            }
            store
                .tables
                .write()
                .await
                .entry(table)
                .or_default()
                .extend(inserted.iter().cloned());
            Ok(inserted)
        })
    }

    fn select(&self, token: Option<String>, query: Select) -> BoxFuture<'static, Result<Vec<Value>, StoreError>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_token(&token)?;
            if store.rejected_selects.read().await.contains(&query.table) {
                return Err(StoreError::Rejected(format!(
                    "permission denied for table {}",
                    query.table.as_str()
                )));
            }
            let tables = store.tables.read().await;
            let mut rows: Vec<Value> = tables
                .get(&query.table)
                .map(|rows| rows.iter().filter(|r| matches(r, &query.filters)).cloned().collect())
                .unwrap_or_default();
            if let Some(order) = &query.order {
                // stable sort keeps insertion order among equal keys
                rows.sort_by(|a, b| {
                    let ord = compare(a.get(order.column), b.get(order.column));
                    if order.ascending {
                        ord
                    } else {
                        ord.reverse()
                    }
                });
            }
            if let Some(embed) = &query.embed {
                let related = tables.get(&embed.table).cloned().unwrap_or_default();
                for row in rows.iter_mut() {
                    let key = row.get(embed.local_key).cloned();
                    let found = related
                        .iter()
                        .find(|r| key.is_some() && r.get("id") == key.as_ref())
                        .map(|r| project(r, embed.columns))
                        .unwrap_or(Value::Null);
                    if let Value::Object(fields) = row {
                        fields.insert(embed.table.as_str().to_string(), found);
                    }
                }
            }
            Ok(rows)
        })
    }

    fn delete(
        &self,
        token: Option<String>,
        table: Table,
        filters: Vec<Filter>,
    ) -> BoxFuture<'static, Result<(), StoreError>> {
        let store = self.clone();
        Box::pin(async move {
            store.check_token(&token)?;
            if let Some(rows) = store.tables.write().await.get_mut(&table) {
                rows.retain(|r| !matches(r, &filters));
            }
            Ok(())
        })
    }
}
