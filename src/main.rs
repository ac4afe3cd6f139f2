mod config;
mod handlers;
mod hub;
mod models;
mod notifier;
mod pipeline;
mod redis_client;
mod routes;
mod simulator;
mod state;
mod violation_store;
mod websocket;

use std::process::ExitCode;
use std::time::Duration;

use dotenvy::dotenv;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .compact()
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(1);
        }
    };

    let prometheus_handle = match metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
    {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to install metrics recorder");
            return ExitCode::from(2);
        }
    };

    let state = match AppState::new(config.clone()).await {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "startup dependency failure");
            return ExitCode::from(2);
        }
    };

    let cors = match &config.allowed_origin {
        Some(origin) => match origin.parse::<axum::http::HeaderValue>() {
            Ok(value) => CorsLayer::new()
                .allow_origin(value)
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers([axum::http::header::CONTENT_TYPE]),
            Err(e) => {
                error!(error = %e, "invalid ALLOWED_ORIGIN");
                return ExitCode::from(1);
            }
        },
        None => CorsLayer::permissive(),
    };

    // The request timeout sits above the pipeline deadline so the
    // orchestrator's fallback path, not the HTTP layer, bounds latency.
    let request_timeout = config.llm_timeout + Duration::from_secs(5);

    let app = routes::create_router(state)
        .route(
            "/metrics",
            axum::routing::get(move || async move { prometheus_handle.render() }),
        )
        .layer(TimeoutLayer::new(request_timeout))
        .layer(cors);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr, "failed to bind listener");
            return ExitCode::from(2);
        }
    };

    info!(addr, "moderation pipeline listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    match server.await {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::from(3)
        }
    }
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
