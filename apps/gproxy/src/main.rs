mod cli;
mod health;
mod logging;
mod messages;
mod oauth;
mod state;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;

use cli::Cli;
use state::AppState;

/// §4.9 step 1: 100 MiB request body cap.
const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let gateway = gproxy_core::bootstrap(cli.config_dir.as_deref(), cli.port);
    let config_dir = gateway.config.config_dir.clone();
    let port = gateway.config.port;

    let _logging_guard = logging::init(&config_dir, &cli.log_level);

    let pid_lock = gproxy_core::pid_lock::PidLock {
        pid: std::process::id(),
        started_at: gproxy_common::now_millis(),
    };
    gproxy_core::pid_lock::write(&config_dir, pid_lock).await?;

    let state = AppState::new(gateway);

    let app = Router::new()
        .route("/v1/messages", post(messages::post_messages))
        .route("/healthz", get(health::healthz))
        .route("/_status", get(health::status))
        .route("/google/login", get(oauth::google::login))
        .route("/google/login/start", get(oauth::google::login_start))
        .route("/google/callback", get(oauth::google::callback))
        .route("/google/status", get(oauth::google::status))
        .route("/google/logout", post(oauth::google::logout))
        .route("/codex/login", get(oauth::codex::login))
        .route("/codex/login/start", get(oauth::codex::login_start))
        .route("/codex/callback", get(oauth::codex::callback))
        .route("/codex/status", get(oauth::codex::status))
        .route("/codex/logout", post(oauth::codex::logout))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state);

    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "gproxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    gproxy_core::pid_lock::remove(&config_dir).await;
    tracing::info!("gproxy shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
