use crate::auth::{AuthError, AuthUser};
use crate::error::{AppError, ErrorDetail, RepoError};
use crate::models::{validate_new_quiz, NewQuiz, QuestionDraft, Quiz};
use crate::runs::{Advance, RunError};
use crate::session::{SessionRecord, CSRF_COOKIE, CSRF_HEADER, SESSION_COOKIE};
use crate::state::AppState;
use crate::views::{self, SubmittedView, TakeQuizView};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

const RATE_WINDOW: Duration = Duration::from_secs(60);

static RATE_LIMIT: Lazy<DashMap<String, (u32, Instant)>> = Lazy::new(DashMap::new);

fn check_rate_limit(scope: &str, key: &str, limit_per_minute: u32) -> bool {
    let now = Instant::now();
    RATE_LIMIT.retain(|_, (_, started)| now.duration_since(*started) <= RATE_WINDOW);
    let full_key = format!("{scope}:{key}");
    let mut entry = RATE_LIMIT.entry(full_key).or_insert((0, now));
    if now.duration_since(entry.1) > RATE_WINDOW {
        *entry = (1, now);
        true
    } else if entry.0 >= limit_per_minute {
        false
    } else {
        entry.0 += 1;
        true
    }
}

fn client_key(headers: &HeaderMap) -> &str {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .unwrap_or("local")
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn current_session(state: &AppState, jar: &CookieJar) -> Option<SessionRecord> {
    state.session(jar.get(SESSION_COOKIE).map(|c| c.value())).await
}

/// A refused access token also ends the browser session holding it.
async fn repo_failure(state: &AppState, jar: &CookieJar, err: RepoError, req_id: String) -> AppError {
    if err == RepoError::Unauthenticated {
        if let Some(sid) = jar.get(SESSION_COOKIE) {
            if let Some(ended) = state.sessions.sign_out(sid.value()).await {
                warn!(user_id = %ended.user.id, "access token refused, session ended");
            }
        }
    }
    AppError::from_repo(err, req_id)
}

fn ensure_csrf(headers: &HeaderMap, session: &SessionRecord) -> bool {
    headers
        .get(CSRF_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|v| v == session.csrf_token)
        .unwrap_or(false)
}

fn csrf_rejected(req_id: String) -> AppError {
    AppError::new(StatusCode::FORBIDDEN, "FORBIDDEN", "csrf token invalid", req_id)
}

fn rate_limited(req_id: String) -> AppError {
    AppError::new(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", "too many requests", req_id)
}

fn invalid_payload(errors: validator::ValidationErrors, req_id: String) -> AppError {
    let mut details: Vec<ErrorDetail> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| ErrorDetail {
                field: field.to_string(),
                issue: e
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| e.code.to_string()),
            })
        })
        .collect();
    details.sort_by(|a, b| a.field.cmp(&b.field));
    AppError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "invalid email/password", req_id).with_details(details)
}

fn run_error(err: RunError, req_id: String) -> AppError {
    let status = match err {
        RunError::NotFound => StatusCode::NOT_FOUND,
        RunError::NotOwner => StatusCode::FORBIDDEN,
        RunError::InvalidOption => StatusCode::BAD_REQUEST,
        RunError::NoQuestions | RunError::Unanswered | RunError::Submitted => StatusCode::CONFLICT,
    };
    let code = match status {
        StatusCode::NOT_FOUND => "NOT_FOUND",
        StatusCode::BAD_REQUEST => "VALIDATION_ERROR",
        StatusCode::FORBIDDEN => "FORBIDDEN",
        _ => "CONFLICT",
    };
    AppError::new(status, code, err.to_string(), req_id)
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn home(State(state): State<AppState>, jar: CookieJar) -> Json<views::HomeView> {
    let session = current_session(&state, &jar).await;
    Json(views::home(session.as_ref().map(|s| &s.user)))
}

pub async fn login_page(State(state): State<AppState>, jar: CookieJar) -> Response {
    match current_session(&state, &jar).await {
        Some(_) => Redirect::to("/dashboard").into_response(),
        None => Json(views::login_form()).into_response(),
    }
}

pub async fn register_page(State(state): State<AppState>, jar: CookieJar) -> Response {
    match current_session(&state, &jar).await {
        Some(_) => Redirect::to("/dashboard").into_response(),
        None => Json(views::register_form()).into_response(),
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    #[validate(email(message = "Enter a valid email address."))]
    pub email: String,
    #[validate(length(min = 6, message = "Password must be at least 6 characters."))]
    pub password: String,
    pub confirm_password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginPayload {
    #[validate(email(message = "Enter a valid email address."))]
    pub email: String,
    #[validate(length(min = 1, message = "Password is required."))]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct UserOut {
    pub id: Uuid,
    pub email: Option<String>,
}

impl From<AuthUser> for UserOut {
    fn from(user: AuthUser) -> Self {
        Self {
            id: user.id,
            email: user.email,
        }
    }
}

pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RegisterPayload>,
) -> Result<(StatusCode, Json<UserOut>), AppError> {
    let req_id = request_id_from_headers(&headers);
    if !check_rate_limit("auth_register", client_key(&headers), 20) {
        return Err(rate_limited(req_id));
    }
    if let Err(errors) = payload.validate() {
        return Err(invalid_payload(errors, req_id));
    }
    if payload.password != payload.confirm_password {
        return Err(AppError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "Passwords do not match", req_id)
            .with_details(vec![ErrorDetail {
                field: "confirmPassword".into(),
                issue: "must match password".into(),
            }]));
    }

    let user = state
        .auth
        .sign_up(payload.email.trim(), &payload.password)
        .await
        .map_err(|err| match err {
            AuthError::AlreadyRegistered => {
                AppError::new(StatusCode::CONFLICT, "CONFLICT", err.to_string(), req_id.clone())
            }
            other => AppError::from_repo(other.into(), req_id.clone()),
        })?;
    info!(user_id = %user.id, "registered");
    Ok((StatusCode::CREATED, Json(user.into())))
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<LoginPayload>,
) -> Result<(CookieJar, Json<UserOut>), AppError> {
    let req_id = request_id_from_headers(&headers);
    if !check_rate_limit("auth_login", client_key(&headers), 30) {
        return Err(rate_limited(req_id));
    }
    if let Err(errors) = payload.validate() {
        return Err(invalid_payload(errors, req_id));
    }

    let session = state
        .auth
        .sign_in_with_password(payload.email.trim(), &payload.password)
        .await
        .map_err(|err| match err {
            AuthError::InvalidCredentials => {
                AppError::new(StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", err.to_string(), req_id.clone())
            }
            other => AppError::from_repo(other.into(), req_id.clone()),
        })?;

    let csrf_token = Uuid::new_v4().to_string();
    let user = session.user.clone();
    let session_id = state
        .sessions
        .sign_in(SessionRecord {
            user: session.user,
            access_token: session.access_token,
            csrf_token: csrf_token.clone(),
        })
        .await;

    let cookie = Cookie::build((SESSION_COOKIE, session_id))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .build();
    let csrf_cookie = Cookie::build((CSRF_COOKIE, csrf_token))
        .http_only(false)
        .same_site(SameSite::Lax)
        .path("/")
        .build();

    Ok((jar.add(cookie).add(csrf_cookie), Json(user.into())))
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<(CookieJar, StatusCode), AppError> {
    let req_id = request_id_from_headers(&headers);
    let session = current_session(&state, &jar)
        .await
        .ok_or_else(|| AppError::from_repo(RepoError::Unauthenticated, req_id.clone()))?;
    if !ensure_csrf(&headers, &session) {
        return Err(csrf_rejected(req_id));
    }
    if let Err(err) = state.auth.sign_out(&session.access_token).await {
        warn!(user_id = %session.user.id, "remote sign-out failed: {}", err);
    }
    if let Some(sid) = jar.get(SESSION_COOKIE).map(|c| c.value().to_string()) {
        state.sessions.sign_out(&sid).await;
    }
    let jar = jar
        .remove(Cookie::build(SESSION_COOKIE).path("/"))
        .remove(Cookie::build(CSRF_COOKIE).path("/"));
    Ok((jar, StatusCode::NO_CONTENT))
}

/// Confirms the session token with the auth service; a stale token ends the session.
pub async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Json<UserOut>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let session = current_session(&state, &jar)
        .await
        .ok_or_else(|| AppError::from_repo(RepoError::Unauthenticated, req_id.clone()))?;
    match state.auth.get_user(&session.access_token).await {
        Ok(user) => Ok(Json(user.into())),
        Err(AuthError::InvalidToken) => {
            if let Some(sid) = jar.get(SESSION_COOKIE) {
                state.sessions.sign_out(sid.value()).await;
            }
            Err(AppError::from_repo(RepoError::Unauthenticated, req_id))
        }
        Err(other) => Err(AppError::from_repo(other.into(), req_id)),
    }
}

pub async fn list_quizzes(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Json<views::QuizListView>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let ctx = state.context(jar.get(SESSION_COOKIE).map(|c| c.value())).await;
    let quizzes = match state.repo.fetch_quizzes(&ctx).await {
        Ok(quizzes) => quizzes,
        Err(e) => return Err(repo_failure(&state, &jar, e, req_id).await),
    };
    Ok(Json(views::quiz_list(&quizzes)))
}

pub async fn quiz_overview(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(quiz_id): Path<Uuid>,
) -> Result<Json<views::QuizOverview>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let ctx = state.context(jar.get(SESSION_COOKIE).map(|c| c.value())).await;
    let (quiz, questions) = match state.repo.fetch_quiz_with_questions(&ctx, quiz_id).await {
        Ok(found) => found,
        Err(e) => return Err(repo_failure(&state, &jar, e, req_id).await),
    };
    Ok(Json(views::quiz_overview(&quiz, &questions)))
}

pub async fn start_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(quiz_id): Path<Uuid>,
) -> Result<(StatusCode, Json<TakeQuizView>), AppError> {
    let req_id = request_id_from_headers(&headers);
    if !check_rate_limit("quiz_run", client_key(&headers), 60) {
        return Err(rate_limited(req_id));
    }
    let ctx = state.context(jar.get(SESSION_COOKIE).map(|c| c.value())).await;
    let (quiz, questions) = match state.repo.fetch_quiz_with_questions(&ctx, quiz_id).await {
        Ok(found) => found,
        Err(e) => return Err(repo_failure(&state, &jar, e, req_id).await),
    };
    let run = state
        .runs
        .start(quiz, questions, ctx.user_id())
        .await
        .map_err(|e| run_error(e, req_id))?;
    info!(quiz_id = %quiz_id, run_id = %run.id, "quiz run started");
    Ok((StatusCode::CREATED, Json(views::take_quiz(&run, Utc::now()))))
}

pub async fn get_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path((quiz_id, run_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<TakeQuizView>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let ctx = state.context(jar.get(SESSION_COOKIE).map(|c| c.value())).await;
    let run = state
        .runs
        .get(quiz_id, run_id, ctx.user_id())
        .await
        .map_err(|e| run_error(e, req_id))?;
    Ok(Json(views::take_quiz(&run, Utc::now())))
}

pub async fn exit_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path((quiz_id, run_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    let ctx = state.context(jar.get(SESSION_COOKIE).map(|c| c.value())).await;
    state
        .runs
        .discard(quiz_id, run_id, ctx.user_id())
        .await
        .map_err(|e| run_error(e, req_id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AnswerPayload {
    pub option: usize,
}

pub async fn select_answer(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path((quiz_id, run_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<AnswerPayload>,
) -> Result<Json<TakeQuizView>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let ctx = state.context(jar.get(SESSION_COOKIE).map(|c| c.value())).await;
    let run = state
        .runs
        .select(quiz_id, run_id, ctx.user_id(), payload.option)
        .await
        .map_err(|e| run_error(e, req_id))?;
    Ok(Json(views::take_quiz(&run, Utc::now())))
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NextOutcome {
    Question(TakeQuizView),
    Submitted(SubmittedView),
}

/// Moves to the next question, or scores and records the attempt after the last.
/// A repeated press while the attempt is being stored gets 409; a failed
/// submission reopens the run so the user can try again.
pub async fn next_question(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path((quiz_id, run_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<NextOutcome>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let ctx = state.context(jar.get(SESSION_COOKIE).map(|c| c.value())).await;
    let advanced = state
        .runs
        .advance(quiz_id, run_id, ctx.user_id())
        .await
        .map_err(|e| run_error(e, req_id.clone()))?;
    match advanced {
        Advance::Moved(run) => Ok(Json(NextOutcome::Question(views::take_quiz(&run, Utc::now())))),
        Advance::Submit(run) => {
            let attempt = match state.runs.record(&state.repo, &ctx, &run, Utc::now()).await {
                Ok(attempt) => attempt,
                Err(e) => return Err(repo_failure(&state, &jar, e, req_id).await),
            };
            info!(quiz_id = %quiz_id, attempt_id = %attempt.id, score = attempt.score, "quiz submitted");
            Ok(Json(NextOutcome::Submitted(views::submitted(quiz_id, attempt.id))))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    #[serde(rename = "attemptId")]
    pub attempt_id: Option<Uuid>,
}

pub async fn results(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(quiz_id): Path<Uuid>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<views::ResultsView>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let attempt_id = query.attempt_id.ok_or_else(|| {
        AppError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "attemptId is required", req_id.clone())
    })?;
    let ctx = state.context(jar.get(SESSION_COOKIE).map(|c| c.value())).await;
    let fetched = futures::try_join!(
        state.repo.fetch_quiz_with_questions(&ctx, quiz_id),
        state.repo.fetch_attempt(&ctx, attempt_id),
    );
    let ((quiz, questions), attempt) = match fetched {
        Ok(found) => found,
        Err(e) => return Err(repo_failure(&state, &jar, e, req_id).await),
    };
    if attempt.quiz_id != quiz.id {
        return Err(AppError::from_repo(RepoError::NotFound("attempt".into()), req_id));
    }
    Ok(Json(views::results(&quiz, &questions, &attempt)))
}

pub async fn create_quiz_page(State(state): State<AppState>, jar: CookieJar) -> Response {
    match current_session(&state, &jar).await {
        Some(session) => Json(views::create_quiz_form(&session.user)).into_response(),
        None => Redirect::to("/login").into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQuizPayload {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    pub questions: Vec<QuestionDraft>,
}

#[derive(Debug, Serialize)]
pub struct CreatedQuiz {
    pub quiz: Quiz,
    pub href: String,
}

pub async fn create_quiz(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<CreateQuizPayload>,
) -> Result<(StatusCode, Json<CreatedQuiz>), AppError> {
    let req_id = request_id_from_headers(&headers);
    let session = current_session(&state, &jar).await;
    if let Some(session) = &session {
        if !ensure_csrf(&headers, session) {
            return Err(csrf_rejected(req_id));
        }
    }
    let ctx = session.as_ref().map(|s| s.context()).unwrap_or_default();

    let draft = NewQuiz {
        title: payload.title,
        description: payload.description,
        category: payload.category,
        difficulty: payload.difficulty,
        author_name: session
            .as_ref()
            .map(|s| views::author_name(&s.user))
            .unwrap_or_else(|| "Anonymous".to_string()),
        questions: payload.questions,
    };
    if let Err(issues) = validate_new_quiz(&draft) {
        return Err(AppError::validation(issues, req_id));
    }

    let quiz = match state.repo.create_quiz(&ctx, draft).await {
        Ok(quiz) => quiz,
        Err(e) => return Err(repo_failure(&state, &jar, e, req_id).await),
    };
    let href = format!("/quiz/{}", quiz.id);
    Ok((StatusCode::CREATED, Json(CreatedQuiz { quiz, href })))
}

pub async fn dashboard(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Response, AppError> {
    let req_id = request_id_from_headers(&headers);
    let Some(session) = current_session(&state, &jar).await else {
        return Ok(Redirect::to("/login").into_response());
    };
    let ctx = session.context();
    let fetched = futures::try_join!(
        state.repo.fetch_user_quizzes(&ctx),
        state.repo.fetch_user_attempts(&ctx),
    );
    let (quizzes, attempts) = match fetched {
        Ok(found) => found,
        Err(e) => return Err(repo_failure(&state, &jar, e, req_id).await),
    };
    Ok(Json(views::dashboard(&session.user, &quizzes, &attempts)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_counts_per_scope_and_key() {
        assert!(check_rate_limit("test_scope", "1.2.3.4", 2));
        assert!(check_rate_limit("test_scope", "1.2.3.4", 2));
        assert!(!check_rate_limit("test_scope", "1.2.3.4", 2));
        assert!(check_rate_limit("test_scope", "5.6.7.8", 2));
        assert!(check_rate_limit("other_scope", "1.2.3.4", 2));
    }

    #[test]
    fn client_key_uses_first_forwarded_address() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_key(&headers), "local");
        headers.insert("x-forwarded-for", "10.0.0.1, 10.0.0.2".parse().unwrap());
        assert_eq!(client_key(&headers), "10.0.0.1");
    }

    #[test]
    fn register_payload_rules() {
        let bad = RegisterPayload {
            email: "nope".into(),
            password: "123".into(),
            confirm_password: "123".into(),
        };
        let err = invalid_payload(bad.validate().unwrap_err(), "r".into());
        let fields: Vec<_> = err.details.iter().map(|d| d.field.as_str()).collect();
        assert_eq!(fields, vec!["email", "password"]);

        let ok = RegisterPayload {
            email: "a@example.com".into(),
            password: "secret1".into(),
            confirm_password: "secret1".into(),
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn run_errors_map_to_statuses() {
        assert_eq!(run_error(RunError::NotFound, "r".into()).status, StatusCode::NOT_FOUND);
        assert_eq!(run_error(RunError::Unanswered, "r".into()).status, StatusCode::CONFLICT);
        assert_eq!(run_error(RunError::InvalidOption, "r".into()).code, "VALIDATION_ERROR");
        assert_eq!(run_error(RunError::NotOwner, "r".into()).code, "FORBIDDEN");
    }

    #[test]
    fn rate_limit_drops_expired_windows() {
        let stale = Instant::now()
            .checked_sub(Duration::from_secs(120))
            .expect("clock far enough from boot");
        RATE_LIMIT.insert("expiry_scope:9.9.9.9".to_string(), (5, stale));
        assert!(check_rate_limit("expiry_scope", "1.1.1.1", 5));
        assert!(!RATE_LIMIT.contains_key("expiry_scope:9.9.9.9"));
        assert!(RATE_LIMIT.contains_key("expiry_scope:1.1.1.1"));
    }
}
