use crate::handlers;
use crate::session::CSRF_HEADER;
use crate::state::AppState;
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_credentials(true)
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::COOKIE,
            HeaderName::from_static(CSRF_HEADER),
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("x-forwarded-for"),
        ])
}

/// `/create-quiz` and `/dashboard` send visitors without a session to
/// `/login`; `/login` and `/register` send signed-in users to `/dashboard`.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/", get(handlers::home))
        .route("/login", get(handlers::login_page).post(handlers::login))
        .route("/register", get(handlers::register_page).post(handlers::register))
        .route("/logout", post(handlers::logout))
        .route("/me", get(handlers::me))
        .route("/quizzes", get(handlers::list_quizzes))
        .route("/quiz/:id", get(handlers::quiz_overview))
        .route("/quiz/:id/runs", post(handlers::start_run))
        .route(
            "/quiz/:id/runs/:run_id",
            get(handlers::get_run).delete(handlers::exit_run),
        )
        .route("/quiz/:id/runs/:run_id/answer", post(handlers::select_answer))
        .route("/quiz/:id/runs/:run_id/next", post(handlers::next_question))
        .route("/quiz/:id/results", get(handlers::results))
        .route(
            "/create-quiz",
            get(handlers::create_quiz_page).post(handlers::create_quiz),
        )
        .route("/dashboard", get(handlers::dashboard))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
