//! Job and download event types plus the per-job fan-out bus.

mod bus;

use serde::{Deserialize, Serialize, Serializer};

pub use bus::EventBus;

/// Lifecycle state of a transcription job.
///
/// The numeric codes are the wire and storage representation and must not
/// change: `QUEUED → RUNNING → {COMPLETED, FAILED, CANCELED}`, with direct
/// `QUEUED → {FAILED, CANCELED}` allowed for jobs rejected before start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobStatus {
    Queued = 1,
    Running = 2,
    Completed = 3,
    Failed = 4,
    Canceled = 5,
}

impl JobStatus {
    pub fn code(&self) -> i64 {
        *self as i64
    }

    pub fn from_code(code: i64) -> Option<JobStatus> {
        match code {
            1 => Some(JobStatus::Queued),
            2 => Some(JobStatus::Running),
            3 => Some(JobStatus::Completed),
            4 => Some(JobStatus::Failed),
            5 => Some(JobStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl Serialize for JobStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for JobStatus {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let code = u8::deserialize(deserializer)?;
        JobStatus::from_code(code as i64)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid job status code {code}")))
    }
}

/// One transcript segment as carried on the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPayload {
    pub idx: i64,
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// One event on a job's stream.
///
/// Every event carries the job's current status and progress; segment
/// events additionally carry the segment, and failure terminals carry the
/// captured error message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment: Option<SegmentPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobEvent {
    pub fn status(job_id: impl Into<String>, status: JobStatus, progress: f64) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            progress,
            segment: None,
            error: None,
        }
    }

    pub fn segment(
        job_id: impl Into<String>,
        status: JobStatus,
        progress: f64,
        segment: SegmentPayload,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            progress,
            segment: Some(segment),
            error: None,
        }
    }

    pub fn failed(job_id: impl Into<String>, progress: f64, error: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Failed,
            progress,
            segment: None,
            error: Some(error.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One event on a model-download stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadEvent {
    Starting {
        model: String,
    },
    Downloading {
        model: String,
        downloaded_bytes: u64,
        total_bytes: u64,
    },
    Complete {
        model: String,
        local_path: String,
    },
    Canceled {
        model: String,
    },
    Failed {
        model: String,
        error: String,
    },
}

impl DownloadEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadEvent::Complete { .. }
                | DownloadEvent::Canceled { .. }
                | DownloadEvent::Failed { .. }
        )
    }
}
