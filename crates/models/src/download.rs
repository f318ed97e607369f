//! Cancellable model downloads with atomic visibility.
//!
//! Artifacts stream into a staging directory that is renamed to the final
//! model directory only on success, so a partially downloaded model is
//! never observed as downloaded.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;

use scribe_catalog::WhisperModel;

use crate::fetcher::{FetchOutcome, Fetcher};
use crate::tracker::DownloadTracker;
use crate::{ModelError, Result};

/// Artifacts fetched per model, mirroring the converted-model repo layout.
/// Optional files are skipped when the remote does not carry them.
pub const MODEL_FILES: &[(&str, bool)] = &[
    ("model.bin", true),
    ("config.json", true),
    ("tokenizer.json", true),
    ("preprocessor_config.json", false),
    ("vocabulary.txt", false),
];

pub struct Downloader {
    models_dir: RwLock<PathBuf>,
    fetcher: Arc<dyn Fetcher>,
    tracker: DownloadTracker,
}

impl Downloader {
    pub fn new(models_dir: impl Into<PathBuf>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            models_dir: RwLock::new(models_dir.into()),
            fetcher,
            tracker: DownloadTracker::new(),
        }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.models_dir
            .read()
            .expect("models dir lock poisoned")
            .clone()
    }

    /// Re-point the models directory (the `models_dir` setting changed).
    pub fn set_models_dir(&self, dir: impl Into<PathBuf>) {
        *self.models_dir.write().expect("models dir lock poisoned") = dir.into();
    }

    pub fn is_downloaded(&self, model: WhisperModel) -> bool {
        model.is_downloaded(&self.models_dir())
    }

    pub fn is_downloading(&self, name: &str) -> bool {
        self.tracker.has(name)
    }

    /// Cancel an in-flight download. Idempotent; returns whether one was
    /// in flight.
    pub fn cancel(&self, name: &str) -> bool {
        self.tracker.cancel(name)
    }

    /// Make sure the model's artifacts are present locally, downloading
    /// without progress reporting if needed.
    pub async fn ensure(&self, model: WhisperModel) -> Result<PathBuf> {
        self.download(model, |_, _| {}).await
    }

    /// Download a model's artifacts, reporting `(downloaded, total)` after
    /// every chunk. `downloaded` is monotonically non-decreasing and
    /// `total` is stable for the whole call.
    ///
    /// Already-downloaded models report `(total, total)` once and return
    /// immediately. On cancellation or failure nothing partial remains
    /// under the models directory.
    pub async fn download<F>(&self, model: WhisperModel, on_progress: F) -> Result<PathBuf>
    where
        F: Fn(u64, u64) + Send + Sync,
    {
        let models_dir = self.models_dir();
        let final_dir = model.local_dir(&models_dir);
        let total = model.estimated_bytes();

        if model.is_downloaded(&models_dir) {
            on_progress(total, total);
            return Ok(final_dir);
        }

        let name = model.name();
        let token = self
            .tracker
            .start(name)
            .ok_or_else(|| ModelError::DownloadInProgress(name.to_string()))?;

        let result = self
            .transfer(model, &models_dir, &final_dir, &token, &on_progress)
            .await;
        self.tracker.finish(name);

        match result {
            Ok(()) => {
                tracing::info!(model = name, dir = %final_dir.display(), "model downloaded");
                Ok(final_dir)
            }
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(staging_dir(&models_dir, name)).await;
                let _ = tokio::fs::remove_dir_all(&final_dir).await;
                if matches!(e, ModelError::Canceled) {
                    tracing::info!(model = name, "download canceled");
                } else {
                    tracing::warn!(model = name, error = %e, "download failed");
                }
                Err(e)
            }
        }
    }

    async fn transfer<F>(
        &self,
        model: WhisperModel,
        models_dir: &Path,
        final_dir: &Path,
        token: &CancellationToken,
        on_progress: &F,
    ) -> Result<()>
    where
        F: Fn(u64, u64) + Send + Sync,
    {
        let name = model.name();
        let staging = staging_dir(models_dir, name);
        if staging.exists() {
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&staging).await?;

        let total = model.estimated_bytes();
        let downloaded = AtomicU64::new(0);

        for (file, required) in MODEL_FILES {
            if token.is_cancelled() {
                return Err(ModelError::Canceled);
            }
            let url = format!(
                "https://huggingface.co/{}/resolve/main/{}",
                model.repo_id(),
                file
            );
            let dest = staging.join(file);
            tracing::debug!(model = name, url = %url, "fetching artifact");

            let on_chunk = |chunk: u64| {
                let so_far = downloaded.fetch_add(chunk, Ordering::Relaxed) + chunk;
                on_progress(so_far, total);
            };
            match self.fetcher.fetch(&url, &dest, token, &on_chunk).await? {
                FetchOutcome::Fetched(_) => {}
                FetchOutcome::NotFound if *required => {
                    return Err(ModelError::DownloadFailed(format!(
                        "missing required artifact {file} in {}",
                        model.repo_id()
                    )));
                }
                FetchOutcome::NotFound => {
                    let _ = tokio::fs::remove_file(&dest).await;
                }
            }
        }

        if token.is_cancelled() {
            return Err(ModelError::Canceled);
        }

        // Atomic visibility: the model dir appears only fully populated.
        if final_dir.exists() {
            tokio::fs::remove_dir_all(final_dir).await?;
        }
        tokio::fs::rename(&staging, final_dir).await?;
        Ok(())
    }

    /// Remove a model's local artifacts. Returns whether a directory was
    /// removed.
    pub async fn delete(&self, model: WhisperModel) -> Result<bool> {
        let dir = model.local_dir(&self.models_dir());
        if !dir.exists() {
            return Ok(false);
        }
        tokio::fs::remove_dir_all(&dir).await?;
        tracing::info!(model = model.name(), "model deleted");
        Ok(true)
    }
}

fn staging_dir(models_dir: &Path, name: &str) -> PathBuf {
    models_dir.join(format!(".staging-{name}"))
}
