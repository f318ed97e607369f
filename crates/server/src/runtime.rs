//! Default recognition runtime: an external transcriber process emitting
//! one JSON segment per stdout line.
//!
//! The engine only needs a finite, ordered segment stream per audio file;
//! shelling out keeps the heavyweight inference stack out of this process
//! the same way the duration probe shells out to ffprobe.

use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;

use serde::Deserialize;

use scribe_catalog::WhisperModel;
use scribe_engine::{
    EngineError, ModelLoader, RawSegment, RecognitionOptions, SegmentIter, SpeechModel,
};

const DEFAULT_RECOGNIZER_BIN: &str = "whisper-transcribe";

/// Loads process-backed models; the "load" is just remembering the
/// invocation parameters, the process runs once per transcription.
pub struct ProcessRuntimeLoader {
    command: PathBuf,
}

impl ProcessRuntimeLoader {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Binary name from `SCRIBE_RECOGNIZER_BIN`, resolved via PATH.
    pub fn from_env() -> Self {
        let command = std::env::var("SCRIBE_RECOGNIZER_BIN")
            .unwrap_or_else(|_| DEFAULT_RECOGNIZER_BIN.to_string());
        Self::new(command)
    }
}

impl ModelLoader for ProcessRuntimeLoader {
    fn load(
        &self,
        _model: WhisperModel,
        model_dir: &Path,
        device: &str,
        precision: &str,
    ) -> scribe_engine::Result<Arc<dyn SpeechModel>> {
        Ok(Arc::new(ProcessModel {
            command: self.command.clone(),
            model_dir: model_dir.to_path_buf(),
            device: device.to_string(),
            precision: precision.to_string(),
        }))
    }
}

struct ProcessModel {
    command: PathBuf,
    model_dir: PathBuf,
    device: String,
    precision: String,
}

impl SpeechModel for ProcessModel {
    fn transcribe(
        &self,
        audio: &Path,
        options: &RecognitionOptions,
    ) -> scribe_engine::Result<SegmentIter> {
        let mut command = Command::new(&self.command);
        command
            .arg("--model-dir")
            .arg(&self.model_dir)
            .arg("--device")
            .arg(&self.device)
            .arg("--compute-type")
            .arg(&self.precision)
            .arg("--output")
            .arg("jsonl")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null());
        if let Some(language) = &options.language {
            command.arg("--language").arg(language);
        }
        if options.translate_to_english {
            command.arg("--task").arg("translate");
        }
        command.arg(audio);

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::Recognition(format!("failed to spawn recognizer: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Recognition("recognizer has no stdout".to_string()))?;

        Ok(Box::new(JsonlSegments {
            lines: BufReader::new(stdout).lines(),
            child,
            finished: false,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct WireSegment {
    start: f64,
    end: f64,
    text: String,
}

struct JsonlSegments {
    lines: Lines<BufReader<ChildStdout>>,
    child: Child,
    finished: bool,
}

impl Iterator for JsonlSegments {
    type Item = scribe_engine::Result<RawSegment>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            match self.lines.next() {
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => {
                    return Some(
                        serde_json::from_str::<WireSegment>(&line)
                            .map(|s| RawSegment {
                                start: s.start,
                                end: s.end,
                                text: s.text,
                            })
                            .map_err(|e| {
                                EngineError::Recognition(format!("bad segment line: {e}"))
                            }),
                    )
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(EngineError::Recognition(e.to_string())));
                }
                None => {
                    self.finished = true;
                    return match self.child.wait() {
                        Ok(status) if status.success() => None,
                        Ok(status) => Some(Err(EngineError::Recognition(format!(
                            "recognizer exited with {status}"
                        )))),
                        Err(e) => Some(Err(EngineError::Recognition(e.to_string()))),
                    };
                }
            }
        }
    }
}

impl Drop for JsonlSegments {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
