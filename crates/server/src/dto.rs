//! Request and response shapes for the RPC surface.

use serde::{Deserialize, Serialize};

use scribe_catalog::ModelEntry;
use scribe_events::JobStatus;
use scribe_store::{Job, StoredSegment};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct StartTranscriptionRequest {
    pub audio_path: String,
    pub model: Option<String>,
    pub language: Option<String>,
    /// Target language; presence requests translation. `en` uses the
    /// recognizer's built-in task, anything else translates per segment.
    pub target_language: Option<String>,
    pub prefer_gpu: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct StartTranscriptionResponse {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<Job>,
}

#[derive(Debug, Serialize)]
pub struct CancelJobResponse {
    pub canceled: bool,
}

#[derive(Debug, Serialize)]
pub struct DeleteJobResponse {
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct TranscriptResponse {
    pub job: Job,
    pub segments: Vec<StoredSegment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentEditDto {
    pub idx: i64,
    /// Empty string clears a previous edit.
    pub edited_text: String,
}

#[derive(Debug, Deserialize)]
pub struct SaveEditsRequest {
    pub edits: Vec<SegmentEditDto>,
}

#[derive(Debug, Serialize)]
pub struct SaveEditsResponse {
    pub saved: usize,
}

#[derive(Debug, Deserialize)]
pub struct TranslateTranscriptRequest {
    pub target_language: String,
    /// Restrict translation to these segment indices; all when omitted.
    pub segment_indices: Option<Vec<i64>>,
    /// Caller-side unsaved edits, preferred over stored text.
    pub edits: Option<Vec<SegmentEditDto>>,
}

#[derive(Debug, Serialize)]
pub struct TranslatedSegment {
    pub idx: i64,
    pub translated_text: String,
}

#[derive(Debug, Serialize)]
pub struct TranslateTranscriptResponse {
    pub segments: Vec<TranslatedSegment>,
}

#[derive(Debug, Serialize)]
pub struct Settings {
    pub models_dir: String,
    pub prefer_gpu: bool,
    pub default_model: String,
    pub compute_type: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateSettingsRequest {
    pub models_dir: Option<String>,
    pub prefer_gpu: Option<bool>,
    pub default_model: Option<String>,
    pub compute_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListModelsResponse {
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Serialize)]
pub struct CancelDownloadResponse {
    pub canceled: bool,
}

#[derive(Debug, Serialize)]
pub struct DeleteModelResponse {
    pub name: String,
    pub deleted: bool,
}
