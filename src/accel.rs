//! Accelerator probing.
//!
//! The probe answers one question for the planner and the variant selector:
//! which runner library family does this host want, and how much accelerator
//! memory is there to plan against.

use std::process::Command;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

const PROBE_CACHE_TTL: Duration = Duration::from_secs(5);

/// Immutable snapshot of the host's accelerator situation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorInfo {
    /// Accelerator family: `cpu`, `cuda`, `rocm`, `metal`.
    pub library: String,
    /// Build variant within the family, e.g. `v12` for CUDA 12. Empty for
    /// the lowest-common-denominator build.
    pub variant: String,
    /// Best supported CPU ISA extension (`avx2`, `avx`, or empty), used for
    /// the CPU fallback variant regardless of `library`.
    pub cpu_flag: String,
    pub device_count: u64,
    /// Total memory across devices, bytes. Unified memory on Apple Silicon.
    pub vram_bytes: u64,
    /// `std::env::consts::OS` at probe time.
    pub os: String,
}

impl AcceleratorInfo {
    /// The variant tag this host would ideally run.
    pub fn requested_tag(&self) -> String {
        if self.variant.is_empty() {
            self.library.clone()
        } else {
            format!("{}_{}", self.library, self.variant)
        }
    }

    /// A CPU-only snapshot for the current host.
    pub fn cpu_only() -> Self {
        Self {
            library: "cpu".to_string(),
            variant: cpu_flag(),
            cpu_flag: cpu_flag(),
            device_count: 0,
            vram_bytes: 0,
            os: std::env::consts::OS.to_string(),
        }
    }
}

/// Seam for accelerator detection so tests can pin a snapshot.
#[async_trait]
pub trait AcceleratorProbe: Send + Sync {
    async fn probe(&self) -> AcceleratorInfo;
}

/// Probes the host via vendor tools, caching the result briefly.
pub struct SystemProbe {
    cache: Mutex<Option<(Instant, AcceleratorInfo)>>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(None),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AcceleratorProbe for SystemProbe {
    async fn probe(&self) -> AcceleratorInfo {
        let mut cache = self.cache.lock().await;
        if let Some((at, info)) = cache.as_ref() {
            if at.elapsed() < PROBE_CACHE_TTL {
                return info.clone();
            }
        }

        let info = tokio::task::spawn_blocking(detect)
            .await
            .unwrap_or_else(|_| AcceleratorInfo::cpu_only());
        tracing::debug!(
            library = %info.library,
            variant = %info.variant,
            devices = info.device_count,
            vram_bytes = info.vram_bytes,
            "accelerator probe"
        );
        *cache = Some((Instant::now(), info.clone()));
        info
    }
}

/// Best supported x86 SIMD extension, lowest common denominator otherwise.
pub fn cpu_flag() -> String {
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("avx2") {
            return "avx2".to_string();
        }
        if std::arch::is_x86_feature_detected!("avx") {
            return "avx".to_string();
        }
    }
    String::new()
}

fn detect() -> AcceleratorInfo {
    if std::env::consts::OS == "macos" && std::env::consts::ARCH == "aarch64" {
        if let Some(info) = detect_metal() {
            return info;
        }
    }
    if let Some(info) = detect_cuda() {
        return info;
    }
    if let Some(info) = detect_rocm() {
        return info;
    }
    AcceleratorInfo::cpu_only()
}

/// Apple Silicon: GPU memory is unified with system RAM, read via sysctl.
fn detect_metal() -> Option<AcceleratorInfo> {
    let output = Command::new("sysctl").args(["-n", "hw.memsize"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let mem_bytes: u64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
    Some(AcceleratorInfo {
        library: "metal".to_string(),
        variant: String::new(),
        cpu_flag: cpu_flag(),
        device_count: 1,
        vram_bytes: mem_bytes,
        os: std::env::consts::OS.to_string(),
    })
}

fn detect_cuda() -> Option<AcceleratorInfo> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut devices = 0u64;
    let mut total_mib = 0u64;
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let mib: u64 = line.trim().parse().ok()?;
        devices += 1;
        total_mib += mib;
    }
    if devices == 0 {
        return None;
    }

    Some(AcceleratorInfo {
        library: "cuda".to_string(),
        variant: cuda_variant().unwrap_or_default(),
        cpu_flag: cpu_flag(),
        device_count: devices,
        vram_bytes: total_mib * 1024 * 1024,
        os: std::env::consts::OS.to_string(),
    })
}

/// Derive the CUDA build variant (`v11`, `v12`, ...) from the driver banner.
fn cuda_variant() -> Option<String> {
    let output = Command::new("nvidia-smi").output().ok()?;
    let banner = String::from_utf8_lossy(&output.stdout).into_owned();
    parse_cuda_variant(&banner)
}

fn parse_cuda_variant(banner: &str) -> Option<String> {
    let rest = &banner[banner.find("CUDA Version:")? + "CUDA Version:".len()..];
    let version = rest.trim_start();
    let major: String = version.chars().take_while(|c| c.is_ascii_digit()).collect();
    if major.is_empty() {
        None
    } else {
        Some(format!("v{major}"))
    }
}

fn detect_rocm() -> Option<AcceleratorInfo> {
    let output = Command::new("rocm-smi")
        .args(["--showmeminfo", "vram", "--csv"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut devices = 0u64;
    let mut total_bytes = 0u64;
    // csv shape: device,VRAM Total Memory (B),VRAM Total Used Memory (B)
    for line in stdout.lines().skip(1) {
        let mut fields = line.split(',');
        let (Some(_), Some(total)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(bytes) = total.trim().parse::<u64>() else {
            continue;
        };
        devices += 1;
        total_bytes += bytes;
    }
    if devices == 0 {
        return None;
    }

    Some(AcceleratorInfo {
        library: "rocm".to_string(),
        variant: String::new(),
        cpu_flag: cpu_flag(),
        device_count: devices,
        vram_bytes: total_bytes,
        os: std::env::consts::OS.to_string(),
    })
}
