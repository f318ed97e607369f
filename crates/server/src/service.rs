//! The service layer: owns the store, catalog, downloader, cache, engine,
//! and event bus, and implements every RPC method's behavior.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use scribe_catalog::{ModelEntry, WhisperModel};
use scribe_engine::{
    Engine, FfprobeDuration, JobRequest, ModelCache, ModelLoader, Translator,
};
use scribe_events::{DownloadEvent, EventBus, JobEvent, JobStatus, SegmentPayload};
use scribe_models::{Downloader, Fetcher, ModelError};
use scribe_store::{Job, NewJob, SegmentEdit, Store};

use crate::config::Config;
use crate::dto::*;
use crate::error::ApiError;
use crate::validate;

pub type JobEventStream = Pin<Box<dyn Stream<Item = JobEvent> + Send>>;
pub type DownloadEventStream = Pin<Box<dyn Stream<Item = DownloadEvent> + Send>>;

pub struct ScribeService {
    store: Store,
    downloader: Arc<Downloader>,
    engine: Arc<Engine>,
    bus: Arc<EventBus>,
    translator: Arc<dyn Translator>,
    queue: mpsc::UnboundedSender<JobRequest>,
    shutdown: CancellationToken,
}

impl ScribeService {
    /// Open the store (the only fatal failure), recover stale jobs, and
    /// wire the engine to its collaborators.
    pub async fn new(
        config: &Config,
        loader: Arc<dyn ModelLoader>,
        translator: Arc<dyn Translator>,
        fetcher: Arc<dyn Fetcher>,
    ) -> anyhow::Result<Arc<Self>> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Store::open(&config.db_path).await?;

        let recovered = store.fail_stale_jobs().await?;
        if recovered > 0 {
            tracing::info!(recovered, "recovered stale jobs from previous run");
        }

        let models_dir = match store.get_setting("models_dir").await? {
            Some(dir) => PathBuf::from(dir),
            None => config.models_dir.clone(),
        };
        let downloader = Arc::new(Downloader::new(models_dir, fetcher));
        let cache = Arc::new(ModelCache::new(config.cache_bytes));
        let bus = Arc::new(EventBus::new());
        let shutdown = CancellationToken::new();

        let engine = Engine::new(
            store.clone(),
            Arc::clone(&downloader),
            cache,
            loader,
            Arc::clone(&translator),
            Arc::new(FfprobeDuration),
            Arc::clone(&bus),
            shutdown.clone(),
        );
        let queue = engine.spawn_scheduler();

        Ok(Arc::new(Self {
            store,
            downloader,
            engine,
            bus,
            translator,
            queue,
            shutdown,
        }))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    /// Stop accepting new work and cancel everything in flight; running
    /// jobs observe this as cancellation.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
        for model in WhisperModel::all() {
            self.downloader.cancel(model.name());
        }
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    pub async fn health(&self) -> HealthResponse {
        match self.store.get_all_settings().await {
            Ok(_) => HealthResponse {
                ok: true,
                message: "service is healthy".to_string(),
            },
            Err(e) => HealthResponse {
                ok: false,
                message: format!("store unavailable: {e}"),
            },
        }
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    pub async fn start_transcription(
        &self,
        request: StartTranscriptionRequest,
    ) -> Result<StartTranscriptionResponse, ApiError> {
        if self.shutdown.is_cancelled() {
            return Err(ApiError::FailedPrecondition(
                "server is shutting down".to_string(),
            ));
        }

        let audio_path = validate::validate_audio_path(&request.audio_path)?;
        if let Some(target) = &request.target_language {
            validate::validate_translation_target(target)?;
        }

        let settings = self.store.get_all_settings().await?;
        let model_name = request
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .or_else(|| settings.get("default_model").cloned())
            .unwrap_or_else(|| "base".to_string());
        let model = WhisperModel::parse(&model_name)
            .map_err(|e| ApiError::InvalidArgument(e.to_string()))?;
        let prefer_gpu = request.prefer_gpu.unwrap_or_else(|| {
            settings
                .get("prefer_gpu")
                .map(|v| v == "true")
                .unwrap_or(true)
        });
        let compute_type = settings
            .get("compute_type")
            .cloned()
            .unwrap_or_else(|| "auto".to_string());
        let language = request
            .language
            .clone()
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| "auto".to_string());

        let job_id = Store::new_job_id();
        let created = self
            .store
            .create_job(NewJob {
                job_id: job_id.clone(),
                audio_path: audio_path.display().to_string(),
                model: model.name().to_string(),
                language: language.clone(),
                translate: request.target_language.is_some(),
            })
            .await?;
        if !created {
            return Err(ApiError::Internal("failed to create job".to_string()));
        }

        self.engine.register_job(&job_id);
        let accepted = JobRequest {
            job_id: job_id.clone(),
            audio_path,
            model,
            language,
            target_language: request.target_language,
            prefer_gpu,
            compute_type,
        };
        if self.queue.send(accepted).is_err() {
            return Err(ApiError::Internal("job queue is closed".to_string()));
        }

        tracing::info!(job_id = %job_id, model = model.name(), "transcription accepted");
        Ok(StartTranscriptionResponse {
            job_id,
            status: JobStatus::Queued,
        })
    }

    /// Subscribe to a job's events. Live subscription while the job is
    /// non-terminal; full replay from the store afterwards. Replay never
    /// interleaves with live events.
    pub async fn job_events(&self, job_id: &str) -> Result<JobEventStream, ApiError> {
        let job = self.require_job(job_id).await?;
        if job.status.is_terminal() {
            return self.replay(job).await;
        }

        let live = self.bus.subscribe(job_id);
        // The job may have reached terminal state between the read and the
        // subscription; the terminal write precedes its publication, so a
        // non-terminal re-read guarantees the live inbox sees the terminal
        // event, and a terminal re-read falls back to replay.
        let job = self.require_job(job_id).await?;
        if job.status.is_terminal() {
            drop(live);
            self.bus.prune_closed(job_id);
            return self.replay(job).await;
        }
        Ok(Box::pin(UnboundedReceiverStream::new(live)))
    }

    async fn replay(&self, job: Job) -> Result<JobEventStream, ApiError> {
        let segments = self.store.get_segments(&job.job_id, -1).await?;
        Ok(Box::pin(futures::stream::iter(replay_events(job, segments))))
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job, ApiError> {
        self.require_job(job_id).await
    }

    pub async fn list_jobs(&self, query: ListJobsQuery) -> Result<ListJobsResponse, ApiError> {
        let jobs = self.store.list_jobs(query.limit.unwrap_or(100)).await?;
        Ok(ListJobsResponse { jobs })
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<CancelJobResponse, ApiError> {
        if self.engine.cancel_job(job_id) {
            return Ok(CancelJobResponse { canceled: true });
        }
        // Not tracked by the engine: either unknown or already terminal.
        let job = self.require_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(CancelJobResponse { canceled: false });
        }
        self.store.cancel_job(job_id).await?;
        Ok(CancelJobResponse { canceled: true })
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<DeleteJobResponse, ApiError> {
        if self.engine.is_job_active(job_id) {
            return Err(ApiError::FailedPrecondition(format!(
                "job is still active, cancel it first: {job_id}"
            )));
        }
        let deleted = self.store.delete_job(job_id).await?;
        Ok(DeleteJobResponse { deleted })
    }

    pub async fn get_transcript(&self, job_id: &str) -> Result<TranscriptResponse, ApiError> {
        let job = self.require_job(job_id).await?;
        let segments = self.store.get_segments(job_id, -1).await?;
        Ok(TranscriptResponse { job, segments })
    }

    pub async fn save_edits(
        &self,
        job_id: &str,
        request: SaveEditsRequest,
    ) -> Result<SaveEditsResponse, ApiError> {
        self.require_job(job_id).await?;
        let saved = request.edits.len();
        let edits = request
            .edits
            .into_iter()
            .map(|e| SegmentEdit {
                idx: e.idx,
                edited_text: e.edited_text,
            })
            .collect();
        self.store.save_segment_edits(job_id, edits).await?;
        Ok(SaveEditsResponse { saved })
    }

    /// Translate stored transcript segments without mutating the job.
    /// Source preference per segment: caller-supplied edit, then the saved
    /// edit, then the machine text; blank sources are skipped. Identical
    /// sources are translated once per call.
    pub async fn translate_transcript(
        &self,
        job_id: &str,
        request: TranslateTranscriptRequest,
    ) -> Result<TranslateTranscriptResponse, ApiError> {
        validate::validate_translation_target(&request.target_language)?;
        self.require_job(job_id).await?;

        let selected: Option<HashSet<i64>> = request
            .segment_indices
            .map(|indices| indices.into_iter().collect());
        let overrides: HashMap<i64, String> = request
            .edits
            .unwrap_or_default()
            .into_iter()
            .map(|e| (e.idx, e.edited_text))
            .collect();

        let mut memo: HashMap<String, String> = HashMap::new();
        let mut translated = Vec::new();
        for segment in self.store.get_segments(job_id, -1).await? {
            if let Some(selected) = &selected {
                if !selected.contains(&segment.idx) {
                    continue;
                }
            }
            let source = overrides
                .get(&segment.idx)
                .filter(|text| !text.trim().is_empty())
                .cloned()
                .or_else(|| segment.edited_text.clone())
                .unwrap_or_else(|| segment.text.clone());
            let source = source.trim().to_string();
            if source.is_empty() {
                continue;
            }

            let text = match memo.get(&source) {
                Some(hit) => hit.clone(),
                None => {
                    let result = self
                        .translator
                        .translate(&source, &request.target_language)
                        .await
                        .map_err(|e| ApiError::Internal(e.to_string()))?;
                    memo.insert(source, result.clone());
                    result
                }
            };
            translated.push(TranslatedSegment {
                idx: segment.idx,
                translated_text: text,
            });
        }

        Ok(TranslateTranscriptResponse {
            segments: translated,
        })
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn get_settings(&self) -> Result<Settings, ApiError> {
        let settings = self.store.get_all_settings().await?;
        Ok(Settings {
            models_dir: settings
                .get("models_dir")
                .cloned()
                .unwrap_or_else(|| self.downloader.models_dir().display().to_string()),
            prefer_gpu: settings
                .get("prefer_gpu")
                .map(|v| v == "true")
                .unwrap_or(true),
            default_model: settings
                .get("default_model")
                .cloned()
                .unwrap_or_else(|| "base".to_string()),
            compute_type: settings
                .get("compute_type")
                .cloned()
                .unwrap_or_else(|| "auto".to_string()),
        })
    }

    pub async fn update_settings(
        &self,
        request: UpdateSettingsRequest,
    ) -> Result<Settings, ApiError> {
        if let Some(dir) = request.models_dir {
            let path = PathBuf::from(&dir);
            if !path.is_absolute() {
                return Err(ApiError::InvalidArgument(
                    "models_dir must be an absolute path".to_string(),
                ));
            }
            self.store.set_setting("models_dir", &dir).await?;
            self.downloader.set_models_dir(path);
        }
        if let Some(prefer_gpu) = request.prefer_gpu {
            self.store
                .set_setting("prefer_gpu", if prefer_gpu { "true" } else { "false" })
                .await?;
        }
        if let Some(model) = request.default_model {
            WhisperModel::parse(&model).map_err(|e| ApiError::InvalidArgument(e.to_string()))?;
            self.store.set_setting("default_model", &model).await?;
        }
        if let Some(compute_type) = request.compute_type {
            self.store.set_setting("compute_type", &compute_type).await?;
        }
        self.get_settings().await
    }

    // ------------------------------------------------------------------
    // Models
    // ------------------------------------------------------------------

    pub fn list_models(&self) -> ListModelsResponse {
        ListModelsResponse {
            models: self.model_entries(),
        }
    }

    fn model_entries(&self) -> Vec<ModelEntry> {
        scribe_catalog::list_models(&self.downloader.models_dir())
    }

    /// Start a model download and stream its lifecycle. Dropping the
    /// stream before the terminal event cancels the transfer.
    pub fn download_model(&self, name: &str) -> Result<DownloadEventStream, ApiError> {
        let model = WhisperModel::parse(name).map_err(|e| ApiError::NotFound(e.to_string()))?;
        let canonical = model.name().to_string();
        if self.downloader.is_downloading(&canonical) {
            return Err(ApiError::FailedPrecondition(format!(
                "download already in progress for {canonical}"
            )));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<DownloadEvent>();
        let downloader = Arc::clone(&self.downloader);
        {
            let tx = tx.clone();
            let name = canonical.clone();
            let downloader = Arc::clone(&downloader);
            tokio::spawn(async move {
                let _ = tx.send(DownloadEvent::Starting {
                    model: name.clone(),
                });
                let progress_tx = tx.clone();
                let progress_name = name.clone();
                let result = downloader
                    .download(model, move |downloaded, total| {
                        let _ = progress_tx.send(DownloadEvent::Downloading {
                            model: progress_name.clone(),
                            downloaded_bytes: downloaded,
                            total_bytes: total,
                        });
                    })
                    .await;
                let terminal = match result {
                    Ok(path) => DownloadEvent::Complete {
                        model: name,
                        local_path: path.display().to_string(),
                    },
                    Err(ModelError::Canceled) => DownloadEvent::Canceled { model: name },
                    Err(e) => DownloadEvent::Failed {
                        model: name,
                        error: e.to_string(),
                    },
                };
                let _ = tx.send(terminal);
            });
        }

        let guard = DownloadGuard {
            name: canonical,
            downloader,
        };
        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            while let Some(event) = rx.recv().await {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    break;
                }
            }
        }))
    }

    pub fn cancel_download(&self, name: &str) -> Result<CancelDownloadResponse, ApiError> {
        let model = WhisperModel::parse(name).map_err(|e| ApiError::NotFound(e.to_string()))?;
        Ok(CancelDownloadResponse {
            canceled: self.downloader.cancel(model.name()),
        })
    }

    pub async fn delete_model(&self, name: &str) -> Result<DeleteModelResponse, ApiError> {
        let model = WhisperModel::parse(name).map_err(|e| ApiError::NotFound(e.to_string()))?;
        if self.downloader.is_downloading(model.name()) {
            return Err(ApiError::FailedPrecondition(format!(
                "download in progress for {name}, cancel it first"
            )));
        }
        let deleted = self.downloader.delete(model).await?;
        Ok(DeleteModelResponse {
            name: model.name().to_string(),
            deleted,
        })
    }

    async fn require_job(&self, job_id: &str) -> Result<Job, ApiError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("job not found: {job_id}")))
    }
}

/// Replay for subscribers who joined after the terminal event: every
/// persisted segment, then the terminal row itself.
fn replay_events(job: Job, segments: Vec<scribe_store::StoredSegment>) -> Vec<JobEvent> {
    let mut events = Vec::with_capacity(segments.len() + 1);
    for segment in segments {
        events.push(JobEvent::segment(
            &job.job_id,
            job.status,
            job.progress,
            SegmentPayload {
                idx: segment.idx,
                start: segment.start,
                end: segment.end,
                text: segment.text,
            },
        ));
    }
    events.push(JobEvent {
        job_id: job.job_id,
        status: job.status,
        progress: job.progress,
        segment: None,
        error: job.error,
    });
    events
}

/// Cancels the transfer when the event stream is dropped before its
/// terminal event; a finished download makes this a no-op.
struct DownloadGuard {
    name: String,
    downloader: Arc<Downloader>,
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        if self.downloader.cancel(&self.name) {
            tracing::info!(model = %self.name, "subscriber gone, download canceled");
        }
    }
}
