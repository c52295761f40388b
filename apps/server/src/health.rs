//! Health HTTP endpoint.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use ceremony_engine::MonitorRegistry;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_monitors: usize,
    heartbeat_age_secs: u64,
}

/// Create the health router.
pub fn create_health_router(registry: Arc<MonitorRegistry>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(registry)
}

async fn health_handler(State(registry): State<Arc<MonitorRegistry>>) -> impl IntoResponse {
    let body = HealthResponse {
        status: "ok",
        active_monitors: registry.active_count().await,
        heartbeat_age_secs: registry.heartbeat().age().as_secs(),
    };

    if registry.is_healthy() {
        (StatusCode::OK, Json(body))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "stalled",
                ..body
            }),
        )
    }
}

/// Serve the health router on an already bound listener until `shutdown`.
pub fn spawn_health_server(
    listener: TcpListener,
    registry: Arc<MonitorRegistry>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let app = create_health_router(registry);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            error!("Health server error: {}", e);
        }
    })
}

/// Bind the health endpoint on all interfaces and serve it in the background.
pub async fn start_health_server(
    registry: Arc<MonitorRegistry>,
    port: u16,
    shutdown: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Health endpoint listening on http://0.0.0.0:{}/health", port);
    Ok(spawn_health_server(listener, registry, shutdown))
}
