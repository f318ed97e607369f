//! Transfer seam for the downloader.

use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::{ModelError, Result};

/// Per-chunk progress callback; receives the chunk's byte count.
pub type ProgressFn<'a> = &'a (dyn Fn(u64) + Send + Sync);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The artifact was written to `dest`; total bytes transferred.
    Fetched(u64),
    /// The remote has no such artifact (optional files tolerate this).
    NotFound,
}

/// Streams one remote artifact to a local file.
///
/// Implementations poll `cancel` at chunk boundaries and return
/// [`ModelError::Canceled`] promptly once it trips.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
        on_chunk: ProgressFn<'_>,
    ) -> Result<FetchOutcome>;
}

/// HTTP fetcher streaming response bodies straight to disk.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
        on_chunk: ProgressFn<'_>,
    ) -> Result<FetchOutcome> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ModelError::DownloadFailed(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(FetchOutcome::NotFound);
        }
        if !response.status().is_success() {
            return Err(ModelError::DownloadFailed(format!(
                "HTTP {}: {}",
                response.status(),
                url
            )));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut total = 0u64;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(ModelError::Canceled);
            }
            let chunk = chunk.map_err(|e| ModelError::DownloadFailed(e.to_string()))?;
            file.write_all(&chunk).await?;
            total += chunk.len() as u64;
            on_chunk(chunk.len() as u64);
        }
        file.flush().await?;

        Ok(FetchOutcome::Fetched(total))
    }
}
