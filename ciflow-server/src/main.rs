use anyhow::{Context, Result};
use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ciflow_server::config::Config;
use ciflow_server::webhook::webhook_router;
use ciflow_server::{build_dispatcher, AppState, GitHubClient, RecordingLogger};

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "ciflow-bot"
    })))
}

async fn help_handler() -> Json<serde_json::Value> {
    Json(json!({
        "service": "ciflow-bot",
        "version": ciflow_server::get_bot_version(),
        "description": "Mirrors ciflow/ and ci/ pull request labels into refs/tags/<label>/<pr> for CI triggers",
        "endpoints": [
            {
                "path": "/health",
                "method": "GET",
                "description": "Health check endpoint",
                "authentication": "None"
            },
            {
                "path": "/webhook",
                "method": "POST",
                "description": "GitHub webhook receiver for pull_request and push events",
                "authentication": "GitHub webhook signature (X-Hub-Signature-256)"
            },
            {
                "path": "/help",
                "method": "GET",
                "description": "Service information",
                "authentication": "None"
            }
        ],
        "configuration": {
            "required_env_vars": [
                "GITHUB_APP_ID",
                "GITHUB_PRIVATE_KEY",
                "GITHUB_WEBHOOK_SECRET"
            ],
            "optional_env_vars": [
                "PORT (default: 3000)",
                "CONFIG_CACHE_TTL_SECS (default: 300)",
                "RECORDING_ENABLED (default: false)",
                "RECORDING_LOG_PATH (default: recordings.jsonl)",
                "RUST_LOG (default: info)"
            ]
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting ciflow bot {}", ciflow_server::get_bot_version());

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    let recording_logger = if config.recording_enabled {
        info!(
            "Recording enabled, logging to: {}",
            config.recording_log_path
        );
        Some(RecordingLogger::spawn(PathBuf::from(
            &config.recording_log_path,
        )))
    } else {
        None
    };

    let github_client = Arc::new(GitHubClient::new_app(
        config.github_app_id,
        config.github_private_key,
        recording_logger.clone(),
    )?);

    let dispatcher = build_dispatcher(
        github_client.clone(),
        github_client.clone(),
        github_client.clone(),
        github_client,
        config.config_cache_ttl,
    );

    let app_state = Arc::new(AppState {
        dispatcher,
        webhook_secret: config.github_webhook_secret,
        recording_logger,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/help", get(help_handler))
        .merge(webhook_router(app_state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
