//! Model artifact acquisition: cancellable, progress-reporting downloads
//! with atomic visibility.

mod download;
mod fetcher;
mod tracker;

pub use download::{Downloader, MODEL_FILES};
pub use fetcher::{FetchOutcome, Fetcher, HttpFetcher, ProgressFn};
pub use tracker::DownloadTracker;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error(transparent)]
    Catalog(#[from] scribe_catalog::CatalogError),
    #[error("download already in progress for {0}")]
    DownloadInProgress(String),
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("download canceled")]
    Canceled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
