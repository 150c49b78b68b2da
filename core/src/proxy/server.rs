//! Proxy Server - Axum HTTP server
//!
//! Thin transport shell around the orchestrator: buffers the inbound
//! body once, hands it to the pipeline, and maps pipeline errors to the
//! provider's JSON error envelope.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ProxyError;
use crate::proxy::orchestrator::Orchestrator;
use crate::proxy::upstream::{ForwardedResponse, ResponseBody};
use crate::proxy::usage::UsageChannel;

const BODY_LIMIT: usize = 100 * 1024 * 1024; // 100MB

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub usage: Arc<UsageChannel>,
}

/// Proxy server instance
pub struct ProxyServer {
    host: String,
    port: u16,
    state: AppState,
}

impl ProxyServer {
    pub fn new(
        host: String,
        port: u16,
        orchestrator: Arc<Orchestrator>,
        usage: Arc<UsageChannel>,
    ) -> Self {
        Self {
            host,
            port,
            state: AppState {
                orchestrator,
                usage,
            },
        }
    }

    /// Run the proxy server (blocking)
    pub async fn run(self) -> anyhow::Result<()> {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let usage = self.state.usage.clone();

        let app = Router::new()
            // Health check
            .route("/healthz", get(health_check_handler))
            .route("/health", get(health_check_handler))
            // Everything else goes through the orchestrator, which
            // validates the path itself.
            .fallback(proxy_handler)
            .layer(DefaultBodyLimit::max(BODY_LIMIT))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state);

        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tracing::info!("Proxy server listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        // Let the usage worker flush before the process exits.
        usage.shutdown().await;

        tracing::info!("Proxy server stopped");
        Ok(())
    }
}

async fn proxy_handler(State(state): State<AppState>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let body = match axum::body::to_bytes(request.into_body(), BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &format!("Failed to read request body: {}", e),
            );
        }
    };

    match state.orchestrator.handle(method.as_str(), &path, body).await {
        Ok(forwarded) => forwarded_response(forwarded),
        Err(e) => proxy_error_response(e),
    }
}

fn forwarded_response(forwarded: ForwardedResponse) -> Response {
    let mut builder = Response::builder().status(forwarded.status);

    for (name, value) in forwarded.headers.iter() {
        // Recomputed by the transport layer.
        if name == header::CONTENT_LENGTH
            || name == header::TRANSFER_ENCODING
            || name == header::CONNECTION
        {
            continue;
        }
        builder = builder.header(name, value);
    }

    let result = match forwarded.body {
        ResponseBody::Buffered(bytes) => builder.body(Body::from(bytes)),
        ResponseBody::Streaming(stream) => builder.body(Body::from_stream(stream)),
    };

    match result {
        Ok(response) => response,
        Err(e) => error_response(
            StatusCode::BAD_GATEWAY,
            "api_error",
            &format!("Failed to relay upstream response: {}", e),
        ),
    }
}

fn proxy_error_response(error: ProxyError) -> Response {
    let (status, error_type) = match &error {
        ProxyError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
        ProxyError::ServiceUnavailable { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "overloaded_error")
        }
        ProxyError::Forward(_) => (StatusCode::BAD_GATEWAY, "api_error"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "api_error"),
    };
    error_response(status, error_type, &error.to_string())
}

fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": message
            }
        })),
    )
        .into_response()
}

/// Health check handler
async fn health_check_handler() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_statuses() {
        let response = proxy_error_response(ProxyError::ServiceUnavailable {
            attempted: 3,
            provider: "anthropic".to_string(),
        });
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = proxy_error_response(ProxyError::Validation("bad path".to_string()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = proxy_error_response(ProxyError::Forward("boom".to_string()));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn buffered_response_passes_headers_through() {
        let mut forwarded = ForwardedResponse::buffered(
            StatusCode::OK,
            bytes::Bytes::from_static(b"{}"),
        );
        forwarded
            .headers
            .insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        forwarded
            .headers
            .insert(header::CONTENT_LENGTH, "2".parse().unwrap());

        let response = forwarded_response(forwarded);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        // Hop-by-hop / recomputed headers are not copied.
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
    }
}
