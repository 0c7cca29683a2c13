pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod progress;
pub mod repository;
pub mod routes;
pub mod runs;
pub mod session;
pub mod state;
pub mod store;
pub mod views;

pub fn build_state() -> anyhow::Result<state::AppState> {
    let config = config::Config::from_env()?;
    Ok(state::AppState::from_config(config))
}
