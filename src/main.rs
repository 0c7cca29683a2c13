use quiz_maker::{build_state, routes::build_router, session::spawn_event_log};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let state = build_state()?;
    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port).parse()?;
    let _events = spawn_event_log(&state.sessions);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("quiz maker listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
