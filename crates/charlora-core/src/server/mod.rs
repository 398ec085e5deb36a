//! HTTP adapter over [`JobService`].
//!
//! Handlers only translate requests and errors; the rules live in the service.

mod routes;

use std::net::SocketAddr;

use axum::extract::{DefaultBodyLimit, Request};
use axum::http::HeaderName;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::Result;
use crate::service::JobService;

pub use routes::ApiError;

/// Header carrying the request id.
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Build the application router.
pub fn router(service: JobService) -> Router {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    let artifacts = ServeDir::new(&service.config().training.ed_lora_dir);
    let body_limit = service.config().server.max_upload_bytes;

    Router::new()
        .route("/train", post(routes::train).layer(DefaultBodyLimit::max(body_limit)))
        .route("/jobs/:id/status", get(routes::job_status))
        .route("/gpu/diagnostics", get(routes::gpu_diagnostics))
        .route("/config/test", post(routes::config_test))
        .nest_service("/artifacts", artifacts)
        .with_state(service)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
                    let request_id = request
                        .headers()
                        .get(REQUEST_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        request_id = %request_id,
                        method = %request.method(),
                        uri = %request.uri().path(),
                    )
                }))
                .layer(PropagateRequestIdLayer::new(request_id))
                .layer(CorsLayer::permissive()),
        )
}

/// Serve until Ctrl-C.
pub async fn run(service: JobService, address: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(address).await?;
    info!(address = %listener.local_addr()?, "Starting HTTP server");
    axum::serve(listener, router(service)).with_graceful_shutdown(shutdown_signal()).await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C; shutdown only by signal");
        std::future::pending::<()>().await;
    }
}
