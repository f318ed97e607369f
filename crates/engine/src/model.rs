use std::path::Path;
use std::sync::Arc;

use scribe_catalog::WhisperModel;

use crate::Result;

/// Options forwarded to the recognition runtime for one job.
#[derive(Debug, Clone, Default)]
pub struct RecognitionOptions {
    /// Source language code; `None` lets the runtime auto-detect.
    pub language: Option<String>,
    /// Use the runtime's built-in translate-to-English task.
    pub translate_to_english: bool,
}

/// One raw segment as produced by the recognition runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

pub type SegmentIter = Box<dyn Iterator<Item = Result<RawSegment>> + Send>;

/// A loaded recognition model.
///
/// `transcribe` is blocking and is driven from the blocking pool; it
/// yields a finite stream of segments ordered by time.
pub trait SpeechModel: Send + Sync {
    fn transcribe(&self, audio: &Path, options: &RecognitionOptions) -> Result<SegmentIter>;
}

/// Factory for loading recognition models from their local artifacts.
pub trait ModelLoader: Send + Sync {
    fn load(
        &self,
        model: WhisperModel,
        model_dir: &Path,
        device: &str,
        precision: &str,
    ) -> Result<Arc<dyn SpeechModel>>;
}
