use std::sync::Arc;

use outreach_mcp_bridge::{
    build_app,
    config::Config,
    logging,
    mcp::rpc::json_rpc_notification,
    transport::sessions::{spawn_idle_sweeper, SessionRegistry},
    upstream::client::HttpUpstream,
    AppState,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let upstream = HttpUpstream::new(
        &config.upstream_base_url,
        &config.upstream_api_key,
        config.upstream_timeout,
    )?;

    let bind_socket = config.bind_socket()?;
    let state = AppState::from_config(&config, Arc::new(upstream));
    let sessions = state.sessions.clone();
    let shutdown = CancellationToken::new();
    let sweeper = spawn_idle_sweeper(
        sessions.clone(),
        config.session_sweep_interval,
        config.session_idle_timeout,
        shutdown.clone(),
    );

    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(bind_socket).await?;

    info!(
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        upstream = %config.upstream_base_url,
        inbound_auth = config.api_token.is_some(),
        "server starting"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(sessions, shutdown))
        .await?;

    if let Err(err) = sweeper.await {
        warn!(error = %err, "idle sweeper stopped abnormally");
    }
    info!("server stopped");
    Ok(())
}

/// Resolves on Ctrl-C after telling connected clients and closing every
/// session, which ends open event streams so the server can drain.
async fn shutdown_signal(sessions: SessionRegistry, shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }

    info!("shutdown signal received");
    shutdown.cancel();
    sessions.shutdown(&json_rpc_notification(
        "notifications/message",
        json!({ "level": "info", "data": "server shutting down" }),
    ));
}
