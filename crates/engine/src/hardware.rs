//! Execution hardware probe.

use std::time::Duration;

use tokio::sync::OnceCell;

const GPU_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Device and default precision chosen for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device: String,
    pub precision: String,
}

impl DeviceInfo {
    pub fn cpu() -> Self {
        Self {
            device: "cpu".to_string(),
            precision: "int8".to_string(),
        }
    }
}

static GPU_AVAILABLE: OnceCell<bool> = OnceCell::const_new();

/// Pick the execution device for a job.
///
/// CUDA with float16 when an NVIDIA GPU answers, CPU with int8 otherwise.
/// The probe result is cached for the process lifetime.
pub async fn select_device(prefer_gpu: bool) -> DeviceInfo {
    if prefer_gpu && nvidia_gpu_available().await {
        DeviceInfo {
            device: "cuda".to_string(),
            precision: "float16".to_string(),
        }
    } else {
        DeviceInfo::cpu()
    }
}

async fn nvidia_gpu_available() -> bool {
    *GPU_AVAILABLE
        .get_or_init(|| async {
            match tokio::time::timeout(GPU_PROBE_TIMEOUT, probe_nvidia_smi()).await {
                Ok(found) => found,
                Err(_) => {
                    tracing::debug!("gpu probe timed out");
                    false
                }
            }
        })
        .await
}

async fn probe_nvidia_smi() -> bool {
    let output = tokio::process::Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => {
            let name = String::from_utf8_lossy(&output.stdout);
            tracing::info!(gpu = %name.trim(), "nvidia gpu detected");
            true
        }
        _ => false,
    }
}
