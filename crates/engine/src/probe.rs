//! Audio duration probe.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

const DURATION_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Best-effort audio duration lookup. Returns 0.0 when the duration
/// cannot be determined, which disables ratio-based progress.
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn duration_seconds(&self, path: &Path) -> f64;
}

/// Duration probe backed by `ffprobe`.
pub struct FfprobeDuration;

#[async_trait]
impl DurationProbe for FfprobeDuration {
    async fn duration_seconds(&self, path: &Path) -> f64 {
        match tokio::time::timeout(DURATION_PROBE_TIMEOUT, ffprobe_duration(path)).await {
            Ok(Some(seconds)) if seconds > 0.0 => seconds,
            Ok(_) => 0.0,
            Err(_) => {
                tracing::warn!(path = %path.display(), "duration probe timed out");
                0.0
            }
        }
    }
}

async fn ffprobe_duration(path: &Path) -> Option<f64> {
    let output = tokio::process::Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=nw=1:nk=1",
        ])
        .arg(path)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        tracing::debug!(
            path = %path.display(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "ffprobe failed"
        );
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.lines().next()?.trim().parse().ok()
}
