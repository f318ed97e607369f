//! HTTP/JSON binding of the RPC surface: unary routes plus SSE
//! server-streams, served on loopback.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::dto::*;
use crate::error::ApiError;
use crate::service::ScribeService;

/// Maximum message size in either direction.
pub const MAX_MESSAGE_BYTES: usize = 50 * 1024 * 1024;

const SSE_KEEPALIVE: Duration = Duration::from_secs(30);

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

pub fn router(service: Arc<ScribeService>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/jobs", post(start_transcription).get(list_jobs))
        .route("/v1/jobs/:job_id", get(get_job).delete(delete_job))
        .route("/v1/jobs/:job_id/events", get(stream_transcription))
        .route("/v1/jobs/:job_id/cancel", post(cancel_job))
        .route("/v1/jobs/:job_id/transcript", get(get_transcript))
        .route("/v1/jobs/:job_id/edits", post(save_edits))
        .route("/v1/jobs/:job_id/translate", post(translate_transcript))
        .route("/v1/settings", get(get_settings).put(update_settings))
        .route("/v1/models", get(list_models))
        .route("/v1/models/:name", delete(delete_model))
        .route("/v1/models/:name/download", post(download_model))
        .route("/v1/models/:name/cancel", post(cancel_download))
        .layer(DefaultBodyLimit::max(MAX_MESSAGE_BYTES))
        .with_state(service)
}

async fn health(State(service): State<Arc<ScribeService>>) -> Json<HealthResponse> {
    Json(service.health().await)
}

async fn start_transcription(
    State(service): State<Arc<ScribeService>>,
    Json(request): Json<StartTranscriptionRequest>,
) -> Result<Json<StartTranscriptionResponse>, ApiError> {
    service.start_transcription(request).await.map(Json)
}

async fn list_jobs(
    State(service): State<Arc<ScribeService>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    service.list_jobs(query).await.map(Json)
}

async fn get_job(
    State(service): State<Arc<ScribeService>>,
    Path(job_id): Path<String>,
) -> Result<Json<scribe_store::Job>, ApiError> {
    service.get_job(&job_id).await.map(Json)
}

async fn delete_job(
    State(service): State<Arc<ScribeService>>,
    Path(job_id): Path<String>,
) -> Result<Json<DeleteJobResponse>, ApiError> {
    service.delete_job(&job_id).await.map(Json)
}

async fn cancel_job(
    State(service): State<Arc<ScribeService>>,
    Path(job_id): Path<String>,
) -> Result<Json<CancelJobResponse>, ApiError> {
    service.cancel_job(&job_id).await.map(Json)
}

async fn stream_transcription(
    State(service): State<Arc<ScribeService>>,
    Path(job_id): Path<String>,
) -> Result<Sse<SseStream>, ApiError> {
    let events = service.job_events(&job_id).await?;
    let stream: SseStream = Box::pin(events.map(|event| Ok(sse_event("job", &event))));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE)))
}

async fn get_transcript(
    State(service): State<Arc<ScribeService>>,
    Path(job_id): Path<String>,
) -> Result<Json<TranscriptResponse>, ApiError> {
    service.get_transcript(&job_id).await.map(Json)
}

async fn save_edits(
    State(service): State<Arc<ScribeService>>,
    Path(job_id): Path<String>,
    Json(request): Json<SaveEditsRequest>,
) -> Result<Json<SaveEditsResponse>, ApiError> {
    service.save_edits(&job_id, request).await.map(Json)
}

async fn translate_transcript(
    State(service): State<Arc<ScribeService>>,
    Path(job_id): Path<String>,
    Json(request): Json<TranslateTranscriptRequest>,
) -> Result<Json<TranslateTranscriptResponse>, ApiError> {
    service.translate_transcript(&job_id, request).await.map(Json)
}

async fn get_settings(
    State(service): State<Arc<ScribeService>>,
) -> Result<Json<Settings>, ApiError> {
    service.get_settings().await.map(Json)
}

async fn update_settings(
    State(service): State<Arc<ScribeService>>,
    Json(request): Json<UpdateSettingsRequest>,
) -> Result<Json<Settings>, ApiError> {
    service.update_settings(request).await.map(Json)
}

async fn list_models(State(service): State<Arc<ScribeService>>) -> Json<ListModelsResponse> {
    Json(service.list_models())
}

async fn download_model(
    State(service): State<Arc<ScribeService>>,
    Path(name): Path<String>,
) -> Result<Sse<SseStream>, ApiError> {
    let events = service.download_model(&name)?;
    let stream: SseStream = Box::pin(events.map(|event| Ok(sse_event("download", &event))));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE)))
}

async fn cancel_download(
    State(service): State<Arc<ScribeService>>,
    Path(name): Path<String>,
) -> Result<Json<CancelDownloadResponse>, ApiError> {
    service.cancel_download(&name).map(Json)
}

async fn delete_model(
    State(service): State<Arc<ScribeService>>,
    Path(name): Path<String>,
) -> Result<Json<DeleteModelResponse>, ApiError> {
    service.delete_model(&name).await.map(Json)
}

fn sse_event(kind: &str, payload: &impl Serialize) -> Event {
    match serde_json::to_string(payload) {
        Ok(data) => Event::default().event(kind).data(data),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize sse payload");
            Event::default().event("error").data("{}")
        }
    }
}
