//! Service-level integration tests with scripted collaborators.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use scribe_catalog::WhisperModel;
use scribe_engine::{
    ModelLoader, RawSegment, RecognitionOptions, SegmentIter, SpeechModel, TranslateError,
    Translator,
};
use scribe_events::{DownloadEvent, JobStatus};
use scribe_models::{FetchOutcome, Fetcher, ModelError, ProgressFn};
use scribe_server::dto::*;
use scribe_server::{ApiError, Config, ScribeService};
use scribe_store::{NewJob, SegmentEdit, Store};

// ---------------------------------------------------------------------------
// Stub collaborators
// ---------------------------------------------------------------------------

struct FixedModel {
    segments: Vec<RawSegment>,
}

impl SpeechModel for FixedModel {
    fn transcribe(
        &self,
        _audio: &Path,
        _options: &RecognitionOptions,
    ) -> scribe_engine::Result<SegmentIter> {
        let items: Vec<scribe_engine::Result<RawSegment>> =
            self.segments.iter().cloned().map(Ok).collect();
        Ok(Box::new(items.into_iter()))
    }
}

struct FixedLoader {
    segments: Vec<RawSegment>,
}

impl ModelLoader for FixedLoader {
    fn load(
        &self,
        _model: WhisperModel,
        _model_dir: &Path,
        _device: &str,
        _precision: &str,
    ) -> scribe_engine::Result<Arc<dyn SpeechModel>> {
        Ok(Arc::new(FixedModel {
            segments: self.segments.clone(),
        }))
    }
}

#[derive(Default)]
struct RecordingTranslator {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl Translator for RecordingTranslator {
    async fn translate(
        &self,
        text: &str,
        target_lang: &str,
    ) -> std::result::Result<String, TranslateError> {
        self.calls.lock().unwrap().push(text.to_string());
        Ok(format!("{target_lang}:{text}"))
    }
}

/// Fetcher that streams scripted chunks for `model.bin` and writes the
/// remaining artifacts instantly, optionally parking after the first
/// chunk until the download is canceled.
struct ScriptedFetcher {
    chunks: Vec<u64>,
    park_after_first_chunk: bool,
    first_chunk_tx: Mutex<Option<tokio::sync::mpsc::UnboundedSender<()>>>,
}

impl ScriptedFetcher {
    fn new(chunks: Vec<u64>) -> Self {
        Self {
            chunks,
            park_after_first_chunk: false,
            first_chunk_tx: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
        on_chunk: ProgressFn<'_>,
    ) -> scribe_models::Result<FetchOutcome> {
        if !url.ends_with("model.bin") {
            tokio::fs::write(dest, b"aux").await?;
            return Ok(FetchOutcome::Fetched(3));
        }
        let mut written = 0u64;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ModelError::Canceled);
            }
            written += chunk;
            tokio::fs::write(dest, vec![0u8; written as usize]).await?;
            on_chunk(*chunk);
            if i == 0 && self.park_after_first_chunk {
                let maybe_tx = self.first_chunk_tx.lock().unwrap().take();
                if let Some(tx) = maybe_tx {
                    let _ = tx.send(());
                    cancel.cancelled().await;
                    return Err(ModelError::Canceled);
                }
            }
        }
        Ok(FetchOutcome::Fetched(written))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    tmp: tempfile::TempDir,
    service: Arc<ScribeService>,
    translator: Arc<RecordingTranslator>,
}

impl Harness {
    fn store(&self) -> &Store {
        self.service.store()
    }

    fn models_dir(&self) -> PathBuf {
        self.tmp.path().join("models")
    }

    fn audio_file(&self, name: &str) -> PathBuf {
        let path = self.tmp.path().join(name);
        std::fs::write(&path, b"RIFF").unwrap();
        path
    }

    fn mark_downloaded(&self, model: WhisperModel) {
        let dir = self.models_dir().join(model.name());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("model.bin"), b"weights").unwrap();
    }
}

async fn harness_with(segments: Vec<(f64, f64, &str)>, fetcher: ScriptedFetcher) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        db_path: tmp.path().join("data").join("scribe.db"),
        models_dir: tmp.path().join("models"),
        cache_bytes: 1024 * 1024,
        host: "127.0.0.1".to_string(),
        port: 0,
        translate_url: "http://127.0.0.1:5000".to_string(),
    };
    let loader = FixedLoader {
        segments: segments
            .into_iter()
            .map(|(start, end, text)| RawSegment {
                start,
                end,
                text: text.to_string(),
            })
            .collect(),
    };
    let translator = Arc::new(RecordingTranslator::default());
    let service = ScribeService::new(
        &config,
        Arc::new(loader),
        Arc::clone(&translator) as Arc<dyn Translator>,
        Arc::new(fetcher),
    )
    .await
    .unwrap();

    Harness {
        tmp,
        service,
        translator,
    }
}

async fn harness(segments: Vec<(f64, f64, &str)>) -> Harness {
    harness_with(segments, ScriptedFetcher::new(vec![10])).await
}

async fn wait_for_status(store: &Store, job_id: &str, status: JobStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(job) = store.get_job(job_id).await.unwrap() {
                if job.status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {job_id} never reached {status:?}"));
}

/// Insert a completed job with segments straight into the store.
async fn seed_completed_job(store: &Store, job_id: &str, texts: &[&str]) {
    assert!(store
        .create_job(NewJob {
            job_id: job_id.to_string(),
            audio_path: "/tmp/seeded.wav".to_string(),
            model: "base".to_string(),
            language: "auto".to_string(),
            translate: false,
        })
        .await
        .unwrap());
    let segments = texts
        .iter()
        .enumerate()
        .map(|(i, text)| scribe_events::SegmentPayload {
            idx: i as i64,
            start: i as f64,
            end: i as f64 + 1.0,
            text: text.to_string(),
        })
        .collect();
    store.insert_segments_batch(job_id, segments).await.unwrap();
    store
        .update_job_status(job_id, JobStatus::Completed, None)
        .await
        .unwrap();
    store.update_job_progress(job_id, 1.0).await.unwrap();
}

// ---------------------------------------------------------------------------
// Health & validation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn health_reports_ok() {
    let h = harness(vec![]).await;
    let health = h.service.health().await;
    assert!(health.ok);
}

#[tokio::test(flavor = "multi_thread")]
async fn submission_rejections() {
    let h = harness(vec![]).await;

    let cases: Vec<StartTranscriptionRequest> = vec![
        StartTranscriptionRequest {
            audio_path: "relative/clip.wav".to_string(),
            model: None,
            language: None,
            target_language: None,
            prefer_gpu: None,
        },
        StartTranscriptionRequest {
            audio_path: "/etc/alarm.wav".to_string(),
            model: None,
            language: None,
            target_language: None,
            prefer_gpu: None,
        },
        StartTranscriptionRequest {
            audio_path: h.audio_file("notes.txt").display().to_string(),
            model: None,
            language: None,
            target_language: None,
            prefer_gpu: None,
        },
        StartTranscriptionRequest {
            audio_path: h.audio_file("ok.wav").display().to_string(),
            model: None,
            language: None,
            target_language: Some("tlh".to_string()),
            prefer_gpu: None,
        },
    ];
    for request in cases {
        let err = h.service.start_transcription(request).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidArgument(_)));
    }

    // Unknown model is a validation failure on submission.
    let err = h
        .service
        .start_transcription(StartTranscriptionRequest {
            audio_path: h.audio_file("ok.wav").display().to_string(),
            model: Some("gigantic".to_string()),
            language: None,
            target_language: None,
            prefer_gpu: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidArgument(_)));
}

// ---------------------------------------------------------------------------
// Job lifecycle through the service
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn submitted_job_runs_to_completion() {
    let h = harness(vec![(0.0, 5.0, "hello"), (5.0, 10.0, "world")]).await;
    h.mark_downloaded(WhisperModel::Base);

    let audio = h.audio_file("clip.wav");
    let response = h
        .service
        .start_transcription(StartTranscriptionRequest {
            audio_path: audio.display().to_string(),
            model: Some("base".to_string()),
            language: None,
            target_language: None,
            prefer_gpu: Some(false),
        })
        .await
        .unwrap();
    assert_eq!(response.status, JobStatus::Queued);

    wait_for_status(h.store(), &response.job_id, JobStatus::Completed).await;

    let transcript = h.service.get_transcript(&response.job_id).await.unwrap();
    assert_eq!(transcript.job.progress, 1.0);
    let texts: Vec<_> = transcript.segments.iter().map(|s| s.text.as_str()).collect();
    assert_eq!(texts, vec!["hello", "world"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_after_terminal_matches_stored_segments() {
    let h = harness(vec![]).await;
    seed_completed_job(h.store(), "job-done", &["hello", "world"]).await;

    let events: Vec<_> = h
        .service
        .job_events("job-done")
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].segment.as_ref().unwrap().text, "hello");
    assert_eq!(events[0].segment.as_ref().unwrap().idx, 0);
    assert_eq!(events[1].segment.as_ref().unwrap().text, "world");
    assert_eq!(events[1].segment.as_ref().unwrap().idx, 1);
    assert_eq!(events[2].status, JobStatus::Completed);
    assert!(events[2].segment.is_none());
    assert_eq!(events[2].progress, 1.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_of_unknown_job_is_not_found() {
    let h = harness(vec![]).await;
    let err = match h.service.job_events("missing").await {
        Ok(_) => panic!("expected error"),
        Err(e) => e,
    };
    assert!(matches!(err, ApiError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_semantics() {
    let h = harness(vec![]).await;

    let err = h.service.cancel_job("missing").await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));

    seed_completed_job(h.store(), "job-done", &[]).await;
    let response = h.service.cancel_job("job-done").await.unwrap();
    assert!(!response.canceled, "terminal job cancel is a no-op");
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_job_removes_the_row() {
    let h = harness(vec![]).await;
    seed_completed_job(h.store(), "job-done", &["text"]).await;

    assert!(h.service.delete_job("job-done").await.unwrap().deleted);
    assert!(!h.service.delete_job("job-done").await.unwrap().deleted);
    assert!(matches!(
        h.service.get_job("job-done").await.unwrap_err(),
        ApiError::NotFound(_)
    ));
}

// ---------------------------------------------------------------------------
// Edits & translation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn edits_round_trip_and_clear() {
    let h = harness(vec![]).await;
    seed_completed_job(h.store(), "job-1", &["helo", "wrld"]).await;

    h.service
        .save_edits(
            "job-1",
            SaveEditsRequest {
                edits: vec![SegmentEditDto {
                    idx: 0,
                    edited_text: "hello".to_string(),
                }],
            },
        )
        .await
        .unwrap();

    let transcript = h.service.get_transcript("job-1").await.unwrap();
    assert_eq!(transcript.segments[0].edited_text.as_deref(), Some("hello"));
    assert!(transcript.segments[1].edited_text.is_none());

    // Empty string clears the override.
    h.service
        .save_edits(
            "job-1",
            SaveEditsRequest {
                edits: vec![SegmentEditDto {
                    idx: 0,
                    edited_text: String::new(),
                }],
            },
        )
        .await
        .unwrap();
    let transcript = h.service.get_transcript("job-1").await.unwrap();
    assert!(transcript.segments[0].edited_text.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn translate_transcript_prefers_caller_edits_and_memoizes() {
    let h = harness(vec![]).await;
    seed_completed_job(h.store(), "job-1", &["uno", "dos", "", "uno"]).await;
    h.store()
        .save_segment_edits(
            "job-1",
            vec![SegmentEdit {
                idx: 1,
                edited_text: "zwei".to_string(),
            }],
        )
        .await
        .unwrap();

    let response = h
        .service
        .translate_transcript(
            "job-1",
            TranslateTranscriptRequest {
                target_language: "fr".to_string(),
                segment_indices: None,
                edits: Some(vec![SegmentEditDto {
                    idx: 0,
                    edited_text: "ein".to_string(),
                }]),
            },
        )
        .await
        .unwrap();

    // idx 2 was empty and is skipped.
    assert_eq!(response.segments.len(), 3);
    assert_eq!(response.segments[0].translated_text, "fr:ein");
    assert_eq!(response.segments[1].translated_text, "fr:zwei");
    assert_eq!(response.segments[2].translated_text, "fr:uno");

    // Caller edit beat the stored text; stored edit beat the machine text.
    let calls = h.translator.calls.lock().unwrap().clone();
    assert_eq!(calls, vec!["ein", "zwei", "uno"]);

    // The operation mutates nothing.
    let transcript = h.service.get_transcript("job-1").await.unwrap();
    assert_eq!(transcript.segments[0].text, "uno");
    assert_eq!(transcript.segments[1].edited_text.as_deref(), Some("zwei"));
}

#[tokio::test(flavor = "multi_thread")]
async fn translate_transcript_with_subset_and_memo() {
    let h = harness(vec![]).await;
    seed_completed_job(h.store(), "job-1", &["same", "same", "other"]).await;

    let response = h
        .service
        .translate_transcript(
            "job-1",
            TranslateTranscriptRequest {
                target_language: "es".to_string(),
                segment_indices: Some(vec![0, 1]),
                edits: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(response.segments.len(), 2);
    // Identical sources hit the per-call cache.
    assert_eq!(h.translator.calls.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn translate_transcript_rejects_bad_target() {
    let h = harness(vec![]).await;
    seed_completed_job(h.store(), "job-1", &["text"]).await;

    let err = h
        .service
        .translate_transcript(
            "job-1",
            TranslateTranscriptRequest {
                target_language: "xx".to_string(),
                segment_indices: None,
                edits: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidArgument(_)));
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn settings_defaults_and_updates() {
    let h = harness(vec![]).await;

    let settings = h.service.get_settings().await.unwrap();
    assert!(settings.prefer_gpu);
    assert_eq!(settings.default_model, "base");
    assert_eq!(settings.compute_type, "auto");

    let new_models_dir = h.tmp.path().join("elsewhere");
    let updated = h
        .service
        .update_settings(UpdateSettingsRequest {
            models_dir: Some(new_models_dir.display().to_string()),
            prefer_gpu: Some(false),
            default_model: Some("small".to_string()),
            compute_type: Some("int8".to_string()),
        })
        .await
        .unwrap();
    assert!(!updated.prefer_gpu);
    assert_eq!(updated.default_model, "small");
    assert_eq!(updated.compute_type, "int8");
    assert_eq!(
        h.service.downloader().models_dir(),
        new_models_dir,
        "downloader must follow the models_dir setting"
    );

    let err = h
        .service
        .update_settings(UpdateSettingsRequest {
            default_model: Some("gigantic".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidArgument(_)));

    let err = h
        .service
        .update_settings(UpdateSettingsRequest {
            models_dir: Some("relative/models".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidArgument(_)));
}

// ---------------------------------------------------------------------------
// Models & downloads
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn list_models_reflects_downloaded_state() {
    let h = harness(vec![]).await;
    h.mark_downloaded(WhisperModel::Base);

    let models = h.service.list_models().models;
    let base = models.iter().find(|m| m.name == "base").unwrap();
    assert!(base.downloaded);
    assert!(base.local_path.is_some());
    let tiny = models.iter().find(|m| m.name == "tiny").unwrap();
    assert!(!tiny.downloaded);
    assert!(tiny.local_path.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn download_stream_emits_progress_then_complete() {
    let h = harness_with(vec![], ScriptedFetcher::new(vec![25, 25, 50])).await;

    let events: Vec<_> = h
        .service
        .download_model("tiny")
        .unwrap()
        .collect()
        .await;

    assert!(matches!(events[0], DownloadEvent::Starting { .. }));

    let progress: Vec<(u64, u64)> = events
        .iter()
        .filter_map(|e| match e {
            DownloadEvent::Downloading {
                downloaded_bytes,
                total_bytes,
                ..
            } => Some((*downloaded_bytes, *total_bytes)),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 3);
    let total = progress[0].1;
    let mut last = 0;
    for (downloaded, t) in &progress {
        assert!(*downloaded >= last);
        assert_eq!(*t, total);
        last = *downloaded;
    }

    assert!(matches!(events.last().unwrap(), DownloadEvent::Complete { .. }));
    assert!(WhisperModel::Tiny.is_downloaded(&h.models_dir()));
}

#[tokio::test(flavor = "multi_thread")]
async fn download_cancel_mid_stream() {
    let mut fetcher = ScriptedFetcher::new(vec![50, 50]);
    fetcher.park_after_first_chunk = true;
    let (tx, mut first_chunk_rx) = tokio::sync::mpsc::unbounded_channel();
    *fetcher.first_chunk_tx.lock().unwrap() = Some(tx);

    let h = harness_with(vec![], fetcher).await;

    let mut stream = h.service.download_model("tiny").unwrap();
    assert!(matches!(
        stream.next().await.unwrap(),
        DownloadEvent::Starting { .. }
    ));
    assert!(matches!(
        stream.next().await.unwrap(),
        DownloadEvent::Downloading { .. }
    ));
    first_chunk_rx.recv().await.unwrap();

    let response = h.service.cancel_download("tiny").unwrap();
    assert!(response.canceled);

    let terminal = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(terminal, DownloadEvent::Canceled { .. }));
    assert!(stream.next().await.is_none());

    // No directory satisfies the downloaded predicate afterwards.
    assert!(!WhisperModel::Tiny.is_downloaded(&h.models_dir()));
    assert!(!h.models_dir().join("tiny").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_download_stream_cancels_transfer() {
    let mut fetcher = ScriptedFetcher::new(vec![50, 50]);
    fetcher.park_after_first_chunk = true;
    let (tx, mut first_chunk_rx) = tokio::sync::mpsc::unbounded_channel();
    *fetcher.first_chunk_tx.lock().unwrap() = Some(tx);

    let h = harness_with(vec![], fetcher).await;

    let mut stream = h.service.download_model("tiny").unwrap();
    assert!(matches!(
        stream.next().await.unwrap(),
        DownloadEvent::Starting { .. }
    ));
    first_chunk_rx.recv().await.unwrap();

    // Subscriber disconnects.
    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.service.downloader().is_downloading("tiny") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!h.models_dir().join("tiny").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_download_without_transfer_reports_false() {
    let h = harness(vec![]).await;
    assert!(!h.service.cancel_download("tiny").unwrap().canceled);

    let err = h.service.cancel_download("gigantic").unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_model_semantics() {
    let h = harness(vec![]).await;

    let err = h.service.delete_model("gigantic").await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));

    assert!(!h.service.delete_model("base").await.unwrap().deleted);

    h.mark_downloaded(WhisperModel::Base);
    let response = h.service.delete_model("base").await.unwrap();
    assert!(response.deleted);
    assert!(!h.models_dir().join("base").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn already_downloaded_model_completes_immediately() {
    let h = harness(vec![]).await;
    h.mark_downloaded(WhisperModel::Tiny);

    let events: Vec<_> = h
        .service
        .download_model("tiny")
        .unwrap()
        .collect()
        .await;

    // Fast path: one full progress report, then complete.
    assert!(matches!(events[0], DownloadEvent::Starting { .. }));
    let size = WhisperModel::Tiny.estimated_bytes();
    assert!(matches!(
        events[1],
        DownloadEvent::Downloading { downloaded_bytes, total_bytes, .. }
            if downloaded_bytes == size && total_bytes == size
    ));
    assert!(matches!(events[2], DownloadEvent::Complete { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn large_alias_resolves_on_download_surface() {
    let h = harness(vec![]).await;
    h.mark_downloaded(WhisperModel::LargeV3);

    let events: Vec<_> = h
        .service
        .download_model("large")
        .unwrap()
        .collect()
        .await;
    match events.last().unwrap() {
        DownloadEvent::Complete { model, .. } => assert_eq!(model, "large-v3"),
        other => panic!("expected completion, got {other:?}"),
    }
}
