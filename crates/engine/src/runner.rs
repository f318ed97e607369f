//! The per-job worker and the FIFO scheduler that drives it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use scribe_catalog::WhisperModel;
use scribe_events::{EventBus, JobEvent, JobStatus, SegmentPayload};
use scribe_models::Downloader;
use scribe_store::Store;

use crate::cache::{ModelCache, ModelKey};
use crate::hardware;
use crate::model::{ModelLoader, RecognitionOptions, SpeechModel};
use crate::probe::DurationProbe;
use crate::translate::Translator;
use crate::{EngineError, Result};

/// Segments buffered in memory before a transactional flush.
const SEGMENT_BATCH_SIZE: usize = 10;

/// Backpressure bound between the blocking recognizer and the job loop.
const SEGMENT_CHANNEL_CAPACITY: usize = 16;

/// Everything the engine needs to run one accepted job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: String,
    pub audio_path: PathBuf,
    pub model: WhisperModel,
    /// Source language code or "auto".
    pub language: String,
    /// Translation target; `Some("en")` routes through the recognizer's
    /// built-in translate task, any other target translates per segment.
    pub target_language: Option<String>,
    pub prefer_gpu: bool,
    /// Precision label, or "auto" to follow the hardware probe.
    pub compute_type: String,
}

enum Outcome {
    Completed,
    Canceled { progress: f64 },
}

/// Cancellation tokens for jobs that are queued or running.
#[derive(Default)]
struct JobTracker {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl JobTracker {
    fn register(&self, job_id: &str, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.lock().insert(job_id.to_string(), token.clone());
        token
    }

    fn get_or_register(&self, job_id: &str, parent: &CancellationToken) -> CancellationToken {
        let mut tokens = self.lock();
        tokens
            .entry(job_id.to_string())
            .or_insert_with(|| parent.child_token())
            .clone()
    }

    fn cancel(&self, job_id: &str) -> bool {
        match self.lock().get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn finish(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    fn is_active(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tokens.lock().expect("job tracker mutex poisoned")
    }
}

/// Per-job coordinator: model acquisition, recognition, translation,
/// checkpointing, events, cancellation.
pub struct Engine {
    store: Store,
    downloader: Arc<Downloader>,
    cache: Arc<ModelCache>,
    loader: Arc<dyn ModelLoader>,
    translator: Arc<dyn Translator>,
    duration_probe: Arc<dyn DurationProbe>,
    bus: Arc<EventBus>,
    jobs: JobTracker,
    shutdown: CancellationToken,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        downloader: Arc<Downloader>,
        cache: Arc<ModelCache>,
        loader: Arc<dyn ModelLoader>,
        translator: Arc<dyn Translator>,
        duration_probe: Arc<dyn DurationProbe>,
        bus: Arc<EventBus>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            downloader,
            cache,
            loader,
            translator,
            duration_probe,
            bus,
            jobs: JobTracker::default(),
            shutdown,
        })
    }

    /// Register an accepted job so it can be canceled while still queued.
    /// Its token is a child of the shutdown token, so shutdown is observed
    /// as cancellation.
    pub fn register_job(&self, job_id: &str) {
        self.jobs.register(job_id, &self.shutdown);
    }

    /// Flip a job's cancel flag. Returns whether the job was queued or
    /// running; canceling a terminal job is a no-op.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        self.jobs.cancel(job_id)
    }

    pub fn is_job_active(&self, job_id: &str) -> bool {
        self.jobs.is_active(job_id)
    }

    /// Spawn the scheduler task and return its submission queue.
    ///
    /// Jobs run strictly one at a time in accept order; recognition is
    /// therefore serialized process-wide.
    pub fn spawn_scheduler(self: &Arc<Self>) -> mpsc::UnboundedSender<JobRequest> {
        let (tx, mut rx) = mpsc::unbounded_channel::<JobRequest>();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                engine.run_job(request).await;
            }
            tracing::debug!("job scheduler stopped");
        });
        tx
    }

    /// Run one job to its terminal state. Errors are captured on the job;
    /// the caller (the scheduler) never fails.
    pub async fn run_job(&self, request: JobRequest) {
        let job_id = request.job_id.clone();
        let token = self.jobs.get_or_register(&job_id, &self.shutdown);

        if token.is_cancelled() {
            // Canceled while still queued.
            if let Err(e) = self.store.cancel_job(&job_id).await {
                tracing::error!(job_id = %job_id, error = %e, "failed to mark queued job canceled");
            }
            self.bus
                .publish_terminal(&JobEvent::status(&job_id, JobStatus::Canceled, 0.0));
            self.jobs.finish(&job_id);
            return;
        }

        match self.execute(&request, &token).await {
            Ok(Outcome::Completed) => {
                let result = self
                    .store
                    .update_job_status(&job_id, JobStatus::Completed, None)
                    .await;
                if let Err(e) = result {
                    tracing::error!(job_id = %job_id, error = %e, "failed to persist completion");
                }
                if let Err(e) = self.store.update_job_progress(&job_id, 1.0).await {
                    tracing::error!(job_id = %job_id, error = %e, "failed to persist final progress");
                }
                tracing::info!(job_id = %job_id, "transcription completed");
                self.bus
                    .publish_terminal(&JobEvent::status(&job_id, JobStatus::Completed, 1.0));
            }
            Ok(Outcome::Canceled { progress }) => {
                if let Err(e) = self.store.cancel_job(&job_id).await {
                    tracing::error!(job_id = %job_id, error = %e, "failed to persist cancellation");
                }
                tracing::info!(job_id = %job_id, "transcription canceled");
                self.bus
                    .publish_terminal(&JobEvent::status(&job_id, JobStatus::Canceled, progress));
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!(job_id = %job_id, error = %message, "transcription failed");
                if let Err(e) = self
                    .store
                    .update_job_status(&job_id, JobStatus::Failed, Some(message.clone()))
                    .await
                {
                    tracing::error!(job_id = %job_id, error = %e, "failed to persist failure");
                }
                let progress = match self.store.get_job(&job_id).await {
                    Ok(Some(job)) => job.progress,
                    _ => 0.0,
                };
                self.bus
                    .publish_terminal(&JobEvent::failed(&job_id, progress, message));
            }
        }
        self.jobs.finish(&job_id);
    }

    async fn execute(&self, request: &JobRequest, token: &CancellationToken) -> Result<Outcome> {
        let job_id = &request.job_id;
        tracing::info!(
            job_id = %job_id,
            model = request.model.name(),
            language = %request.language,
            translate = request.target_language.is_some(),
            "starting transcription"
        );

        self.store
            .update_job_status(job_id, JobStatus::Running, None)
            .await?;
        self.bus
            .publish(&JobEvent::status(job_id, JobStatus::Running, 0.0));

        let model_dir = self
            .downloader
            .ensure(request.model)
            .await
            .map_err(|e| EngineError::Model(e.to_string()))?;

        let device = hardware::select_device(request.prefer_gpu).await;
        let precision = if request.compute_type == "auto" {
            device.precision
        } else {
            request.compute_type.clone()
        };
        let handle = self
            .load_with_fallback(request.model, &model_dir, &device.device, &precision)
            .await?;

        let duration = {
            let probed = self.duration_probe.duration_seconds(&request.audio_path).await;
            if probed > 0.0 {
                self.store.update_job_duration(job_id, probed).await?;
                Some(probed)
            } else {
                None
            }
        };

        let options = RecognitionOptions {
            language: (request.language != "auto").then(|| request.language.clone()),
            translate_to_english: request.target_language.as_deref() == Some("en"),
        };
        let mut segments = spawn_recognizer(handle, request.audio_path.clone(), options);

        // Per-segment translation for non-English targets; identical source
        // lines are translated once per job.
        let per_segment_target = request
            .target_language
            .clone()
            .filter(|target| target != "en");
        let mut memo: HashMap<String, String> = HashMap::new();

        let mut batch: Vec<SegmentPayload> = Vec::new();
        let mut next_idx: i64 = 0;
        let mut progress = 0.0_f64;
        let mut canceled = false;
        let mut failure: Option<EngineError> = None;

        while let Some(item) = segments.recv().await {
            if token.is_cancelled() {
                canceled = true;
                break;
            }
            let raw = match item {
                Ok(raw) => raw,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            let mut text = raw.text.trim().to_string();
            if let Some(target) = &per_segment_target {
                if !text.is_empty() {
                    match memo.get(&text) {
                        Some(hit) => text = hit.clone(),
                        None => match self.translator.translate(&text, target).await {
                            Ok(translated) => {
                                memo.insert(text, translated.clone());
                                text = translated;
                            }
                            Err(e) => {
                                failure = Some(e.into());
                                break;
                            }
                        },
                    }
                }
            }

            let segment = SegmentPayload {
                idx: next_idx,
                start: raw.start,
                end: raw.end,
                text,
            };
            next_idx += 1;

            batch.push(segment.clone());
            if batch.len() >= SEGMENT_BATCH_SIZE {
                self.store
                    .insert_segments_batch(job_id, std::mem::take(&mut batch))
                    .await?;
            }

            if let Some(total) = duration {
                progress = (segment.end / total).min(1.0);
                self.store.update_job_progress(job_id, progress).await?;
            }
            self.bus.publish(&JobEvent::segment(
                job_id,
                JobStatus::Running,
                progress,
                segment,
            ));
        }

        // Terminating flush covers the remainder, including on cancel.
        self.store
            .insert_segments_batch(job_id, std::mem::take(&mut batch))
            .await?;

        if let Some(e) = failure {
            return Err(e);
        }
        if canceled || token.is_cancelled() {
            return Ok(Outcome::Canceled { progress });
        }
        Ok(Outcome::Completed)
    }

    /// Load through the cache; a failure on a non-CPU device retries once
    /// on CPU with int8 before giving up.
    async fn load_with_fallback(
        &self,
        model: WhisperModel,
        model_dir: &Path,
        device: &str,
        precision: &str,
    ) -> Result<Arc<dyn SpeechModel>> {
        match self.acquire(model, model_dir, device, precision).await {
            Ok(handle) => Ok(handle),
            Err(e) if device != "cpu" => {
                tracing::warn!(
                    model = model.name(),
                    device,
                    error = %e,
                    "model load failed, retrying on cpu/int8"
                );
                self.acquire(model, model_dir, "cpu", "int8").await
            }
            Err(e) => Err(e),
        }
    }

    async fn acquire(
        &self,
        model: WhisperModel,
        model_dir: &Path,
        device: &str,
        precision: &str,
    ) -> Result<Arc<dyn SpeechModel>> {
        let key = ModelKey {
            model: model.name().to_string(),
            device: device.to_string(),
            precision: precision.to_string(),
        };
        if let Some(handle) = self.cache.get(&key) {
            return Ok(handle);
        }

        let loader = Arc::clone(&self.loader);
        let dir = model_dir.to_path_buf();
        let load_key = key.clone();
        let handle = tokio::task::spawn_blocking(move || {
            loader.load(model, &dir, &load_key.device, &load_key.precision)
        })
        .await
        .map_err(|e| EngineError::Load(e.to_string()))??;

        self.cache
            .put(key, Arc::clone(&handle), model.estimated_bytes());
        Ok(handle)
    }
}

/// Drive the blocking recognizer on the blocking pool, handing segments to
/// the async job loop over a bounded channel. The producer stops as soon
/// as the consumer hangs up.
fn spawn_recognizer(
    handle: Arc<dyn SpeechModel>,
    audio: PathBuf,
    options: RecognitionOptions,
) -> mpsc::Receiver<Result<crate::model::RawSegment>> {
    let (tx, rx) = mpsc::channel(SEGMENT_CHANNEL_CAPACITY);
    tokio::task::spawn_blocking(move || {
        let iter = match handle.transcribe(&audio, &options) {
            Ok(iter) => iter,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };
        for item in iter {
            if tx.blocking_send(item).is_err() {
                break;
            }
        }
    });
    rx
}
