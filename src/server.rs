// server.rs — HTTP surface (axum): routes, multipart extraction, error → status mapping.
//
// Routes:
//   GET  /               liveness text
//   POST /process-text   JSON {text}
//   POST /transcribe     multipart field "audio"
//   POST /process-image  multipart field "image"
//
// Handlers only validate and extract; inference runs on tokio's blocking pool.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tower_http::cors::CorsLayer;

use crate::config;
use crate::error::PipelineError;
use crate::pipeline::{FileUpload, Orchestrator, RawInput};
use crate::protocol::{Processed, ResponseErr};

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
}

pub fn build_router(orchestrator: Arc<Orchestrator>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/process-text", post(process_text))
        .route("/transcribe", post(transcribe))
        .route("/process-image", post(process_image))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(AppState { orchestrator })
}

/// Bind and serve until Ctrl-C.
pub async fn serve(addr: SocketAddr, max_upload_bytes: usize, orchestrator: Arc<Orchestrator>) -> anyhow::Result<()> {
    let router = build_router(orchestrator, max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr} (address in use or not permitted)"))?;
    log::info!(
        "Listening on http://{} (max upload {} bytes)",
        listener.local_addr().context("read local address")?,
        max_upload_bytes
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    log::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Cannot listen for Ctrl-C, running until killed: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown signal received");
}

async fn liveness() -> &'static str {
    config::server::LIVENESS_TEXT
}

async fn process_text(State(state): State<AppState>, body: Bytes) -> Result<Json<Processed>, PipelineError> {
    // Malformed JSON is indistinguishable from a missing field to the client.
    let payload: Option<Value> = serde_json::from_slice(&body).ok();
    let input = RawInput::from_text_payload(payload.as_ref())?;
    run_blocking(state.orchestrator, input).await.map(Json)
}

async fn transcribe(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Processed>, PipelineError> {
    let upload = read_file_field(multipart, config::upload::AUDIO_FIELD).await?;
    let input = RawInput::from_audio_upload(upload)?;
    run_blocking(state.orchestrator, input).await.map(Json)
}

async fn process_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Processed>, PipelineError> {
    let upload = read_file_field(multipart, config::upload::IMAGE_FIELD).await?;
    let input = RawInput::from_image_upload(upload)?;
    run_blocking(state.orchestrator, input).await.map(Json)
}

/// First part named `name`. A body that is not multipart at all counts as
/// "field missing".
async fn read_file_field(
    multipart: Result<Multipart, MultipartRejection>,
    name: &str,
) -> Result<Option<FileUpload>, PipelineError> {
    let mut multipart = match multipart {
        Ok(m) => m,
        Err(rejection) => {
            log::debug!("Request is not multipart: {}", rejection.body_text());
            return Ok(None);
        }
    };

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        // Parts without a filename are form values, not files.
        if field.name() != Some(name) || field.file_name().is_none() {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.map_err(multipart_error)?;
        log::debug!(
            "Received '{}' upload: filename={:?}, {} bytes",
            name,
            filename,
            bytes.len()
        );
        return Ok(Some(FileUpload {
            filename,
            bytes: bytes.to_vec(),
        }));
    }
    Ok(None)
}

fn multipart_error(e: MultipartError) -> PipelineError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        PipelineError::PayloadTooLarge(format!("Upload too large: {}", e.body_text()))
    } else {
        PipelineError::validation(format!("Malformed multipart body: {}", e.body_text()))
    }
}

async fn run_blocking(orchestrator: Arc<Orchestrator>, input: RawInput) -> Result<Processed, PipelineError> {
    let modality = input.modality();
    log::info!("Processing {} request", modality);
    tokio::task::spawn_blocking(move || orchestrator.process(input))
        .await
        .map_err(|e| PipelineError::Inference(format!("{modality} worker failed: {e}")))?
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match &self {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if self.is_client_error() {
            log::warn!("Rejected request ({}): {}", self.kind(), self);
        } else {
            log::error!("Request failed ({}): {}", self.kind(), self);
        }
        (status, Json(ResponseErr { error: self.to_string() })).into_response()
    }
}
