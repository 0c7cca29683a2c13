use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use thiserror::Error;

use crate::models::ValidationIssue;

/// Failures raised by repository operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepoError {
    #[error("User not authenticated")]
    Unauthenticated,
    /// Message from the backend, passed through untouched.
    #[error("{0}")]
    Persistence(String),
    #[error("{0} not found")]
    NotFound(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub field: String,
    pub issue: String,
}

impl From<ValidationIssue> for ErrorDetail {
    fn from(issue: ValidationIssue) -> Self {
        Self {
            field: issue.field,
            issue: issue.issue,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ErrorDetail>,
    pub request_id: String,
    pub retry: bool,
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Vec<ErrorDetail>,
    pub request_id: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: Vec::new(),
            request_id: request_id.into(),
        }
    }

    pub fn with_details(mut self, details: Vec<ErrorDetail>) -> Self {
        self.details = details;
        self
    }

    pub fn from_repo(err: RepoError, request_id: impl Into<String>) -> Self {
        let (status, code) = match &err {
            RepoError::Unauthenticated => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
            RepoError::Persistence(_) => (StatusCode::BAD_GATEWAY, "PERSISTENCE_ERROR"),
            RepoError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        };
        Self::new(status, code, err.to_string(), request_id)
    }

    pub fn validation(issues: Vec<ValidationIssue>, request_id: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "validation failed", request_id)
            .with_details(issues.into_iter().map(ErrorDetail::from).collect())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, request_id = %self.request_id, "{}", self.message);
        }
        let payload = ErrorBody {
            error: ErrorPayload {
                code: self.code,
                retry: self.status.is_server_error(),
                message: self.message,
                details: self.details,
                request_id: self.request_id,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}
