//! GPU detection for automatic device selection
//!
//! `auto` device preferences resolve to CUDA when at least one GPU is
//! visible to this process. Detection runs `nvidia-smi` once and is cached
//! for the lifetime of the process.

use std::process::Command;
use std::sync::OnceLock;

/// Cached GPU information
static GPU_INFO: OnceLock<GpuInfo> = OnceLock::new();

/// GPUs visible to this process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuInfo {
    /// Indices reported by nvidia-smi, filtered by CUDA_VISIBLE_DEVICES
    pub indices: Vec<u32>,
    /// Comma-separated value suitable for CUDA_VISIBLE_DEVICES
    pub cuda_visible_devices: String,
}

impl GpuInfo {
    fn from_indices(indices: Vec<u32>) -> Self {
        let cuda_visible_devices = indices
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Self {
            indices,
            cuda_visible_devices,
        }
    }

    /// Get the number of available GPUs
    pub fn count(&self) -> usize {
        self.indices.len()
    }
}

/// Parse `nvidia-smi --query-gpu=index` output, honoring a CUDA_VISIBLE_DEVICES mask
///
/// A mask of `""` or `-1` hides every GPU. Non-numeric masks (GPU UUIDs) are
/// left to the driver and do not filter.
fn parse_indices(stdout: &str, visible: Option<&str>) -> Vec<u32> {
    let detected: Vec<u32> = stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect();

    let Some(mask) = visible.map(str::trim) else {
        return detected;
    };
    if mask.is_empty() || mask == "-1" {
        return Vec::new();
    }

    let allowed: Option<Vec<u32>> = mask.split(',').map(|s| s.trim().parse().ok()).collect();
    match allowed {
        Some(allowed) => detected.into_iter().filter(|i| allowed.contains(i)).collect(),
        None => detected,
    }
}

/// Detect available GPUs using nvidia-smi
pub fn detect_gpus() -> GpuInfo {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=index", "--format=csv,noheader"])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let visible = std::env::var("CUDA_VISIBLE_DEVICES").ok();
            let info = GpuInfo::from_indices(parse_indices(&stdout, visible.as_deref()));

            tracing::info!(
                gpu_count = info.count(),
                indices = ?info.indices,
                cuda_visible_devices = %info.cuda_visible_devices,
                "Detected available GPUs"
            );
            info
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(
                stderr = %stderr,
                "nvidia-smi failed, assuming no GPUs available"
            );
            GpuInfo::default()
        }
        Err(e) => {
            tracing::debug!(
                error = %e,
                "Failed to run nvidia-smi, assuming no GPUs available"
            );
            GpuInfo::default()
        }
    }
}

/// Get cached GPU info, or detect if not initialized
pub fn get_or_init() -> &'static GpuInfo {
    GPU_INFO.get_or_init(detect_gpus)
}
