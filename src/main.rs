use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

mod config;
mod error;
mod extract;
mod models;
mod platform;
mod relay;
#[cfg(test)]
mod testutil;

use config::ServerConfig;
use error::{ApiError, ValidationError};
use models::{AnalyzeRequest, AnalyzeResponse, FormatDescriptor, StreamRequest};
use platform::Platform;

type AppState = Arc<ServerConfig>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ServerConfig::load()?;
    tracing::info!(
        ytdlp = %config.ytdlp_path.display(),
        timeout = config.analyze_timeout_secs,
        cors = config.cors_enabled,
        "configuration loaded"
    );

    let addr = config.socket_addr();
    let app = router(Arc::new(config));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to install Ctrl+C handler: {}", e);
    }
}

fn router(config: AppState) -> Router {
    let cors_enabled = config.cors_enabled;
    let app = Router::new()
        .route("/health", get(health))
        .route("/analyze", post(analyze_endpoint))
        .route("/stream", post(stream_endpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(config);

    if cors_enabled {
        app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers([header::CONTENT_DISPOSITION]),
        )
    } else {
        app
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn analyze_endpoint(
    State(config): State<AppState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| ValidationError::Body(e.body_text()))?;
    let url = extract::validate_url(&config, &req.url)?;

    let response = extract::analyze(&config, url.as_str()).await?;
    Ok(Json(response))
}

async fn stream_endpoint(
    State(config): State<AppState>,
    payload: Result<Json<StreamRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload.map_err(|e| ValidationError::Body(e.body_text()))?;
    let url = extract::validate_url(&config, &req.url)?;
    let format_id = req.format_id.trim();
    if format_id.is_empty() {
        return Err(ValidationError::MissingFormatId.into());
    }

    // Look the URL up first: the title names the download and the format must exist.
    let info = extract::analyze(&config, url.as_str()).await?;
    let selection = match info.find_format(format_id) {
        Some(format) => platform::stream_selection(Platform::detect(url.as_str()), format),
        None if format_id == FormatDescriptor::AUTO_ID => {
            platform::format_expression(url.as_str()).to_string()
        }
        None => return Err(ValidationError::UnknownFormat(format_id.to_string()).into()),
    };
    tracing::info!(url = %url, format_id, %selection, "stream requested");

    let relay = relay::open(&config, url.as_str(), &selection).await?;

    let filename = format!("{}.mp4", extract::safe_filename(&info.title));
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"media.mp4\""));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("video/mp4")),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
        ],
        Body::from_stream(relay.into_stream()),
    )
        .into_response())
}
