//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use rally_core::config::GatewayConfig;
use rally_scheduler::CampaignEngine;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub gateway_config: GatewayConfig,
    pub engine: Arc<CampaignEngine>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(gateway_config: GatewayConfig, engine: Arc<CampaignEngine>) -> Self {
        Self {
            gateway_config,
            engine,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    let api = Router::new()
        .route("/api/v1/operations", post(super::routes::initiate_operation))
        .route("/api/v1/operations/{id}", get(super::routes::operation_status))
        .route(
            "/api/v1/operations/{id}/advance",
            post(super::routes::advance_operation),
        )
        .route(
            "/api/v1/operations/{id}/cancel",
            post(super::routes::cancel_operation),
        )
        .route(
            "/api/v1/targets/{target_id}/complete",
            post(super::routes::complete_target),
        )
        .route(
            "/api/v1/targets/{target_id}/operations",
            get(super::routes::target_operations),
        )
        .route("/api/v1/messages/ready", get(super::routes::ready_messages))
        .route(
            "/api/v1/messages/{id}/delivered",
            post(super::routes::confirm_delivered),
        );

    Router::new()
        .route("/health", get(super::routes::health_check))
        .merge(api)
        .layer(
            CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .allow_origin(Any)
                .max_age(std::time::Duration::from_secs(3600)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server; returns once `shutdown` flips to true.
pub async fn start(
    config: &GatewayConfig,
    engine: Arc<CampaignEngine>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = build_router(AppState::new(config.clone(), engine));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    tracing::info!("🌐 Gateway server stopped");
    Ok(())
}
