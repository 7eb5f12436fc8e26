use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::llm::adapter::{ChatMessage, GenerationOptions, UpstreamTransport};
use crate::relay::generate;
use axum::{
    Router,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info};

pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub transport: Arc<dyn UpstreamTransport>,
}

impl AppState {
    pub fn new(config: Arc<RelayConfig>, transport: Arc<dyn UpstreamTransport>) -> Self {
        Self { config, transport }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub chat: Vec<ChatMessage>,
    #[serde(default)]
    pub options: GenerationOptions,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/generate", post(generate_reply))
        .fallback(fallback)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO))
                .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
        )
        .with_state(state)
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let bind_addr = state.config.bind_addr.clone();
    let app = router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("relay listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn index() -> &'static str {
    "Server is running..."
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not Found")
}

/// Streams the reply as plain text.
///
/// The first chunk is awaited before the status is committed, so a request
/// whose every attempt fails up front gets a 500 with a JSON error. A failure
/// after bytes have gone out can only cut the body short.
async fn generate_reply(
    State(state): State<Arc<AppState>>,
    request: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response, RelayError> {
    let Json(request) = request.map_err(|e| RelayError::MalformedInput(e.body_text()))?;
    info!(
        "generate: {} messages, model {:?}",
        request.chat.len(),
        request.options.model
    );

    let mut chunks = generate(
        state.transport.clone(),
        state.config.clone(),
        request.chat,
        request.options,
        state.config.max_retries,
    );
    let first = match chunks.next().await {
        Some(Ok(chunk)) => Some(chunk),
        Some(Err(e)) => return Err(e),
        None => None,
    };
    let body = stream::iter(first.map(Ok)).chain(chunks);

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response())
}
