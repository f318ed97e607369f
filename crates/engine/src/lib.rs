//! Per-job transcription engine and its collaborators.
//!
//! The recognition runtime, audio probe, and translation endpoint are
//! external collaborators behind trait seams; the engine owns the job
//! state machine, model acquisition (catalog → download → cache), and
//! event publication.

pub mod cache;
pub mod hardware;
mod model;
pub mod probe;
mod runner;
pub mod translate;

pub use cache::{ModelCache, ModelKey};
pub use model::{ModelLoader, RawSegment, RecognitionOptions, SegmentIter, SpeechModel};
pub use probe::{DurationProbe, FfprobeDuration};
pub use runner::{Engine, JobRequest};
pub use translate::{HttpTranslator, TranslateError, Translator, ALLOWED_TARGETS};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model acquisition failed: {0}")]
    Model(String),
    #[error("model load failed: {0}")]
    Load(String),
    #[error("recognition failed: {0}")]
    Recognition(String),
    #[error(transparent)]
    Translation(#[from] TranslateError),
    #[error(transparent)]
    Store(#[from] scribe_store::StoreError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
