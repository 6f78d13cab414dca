//! Hardware discovery for accelerator backends.
//!
//! Probes available compute devices in priority order:
//! CUDA (NVIDIA) → ROCm (AMD) → CPU fallback.
//!
//! Detection uses filesystem probes and vendor SMI tools rather than linking
//! to GPU libraries at compile time, keeping the crate lightweight regardless
//! of which backend ends up serving the model.

use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

/// Device compute capability, e.g. `7.5` for a Turing-class NVIDIA GPU.
///
/// Ordered so that engine capability floors can be compared directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl ComputeCapability {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse the `major.minor` form emitted by `nvidia-smi --query-gpu=compute_cap`.
    pub fn parse(s: &str) -> Option<Self> {
        let (major, minor) = s.trim().split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }
}

impl std::fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Vendor family of a detected accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum AcceleratorKind {
    /// NVIDIA CUDA device
    Cuda,
    /// AMD ROCm device
    Rocm,
    /// CPU-only fallback device
    Cpu,
}

impl std::fmt::Display for AcceleratorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcceleratorKind::Cuda => write!(f, "CUDA"),
            AcceleratorKind::Rocm => write!(f, "ROCm"),
            AcceleratorKind::Cpu => write!(f, "CPU"),
        }
    }
}

/// One schedulable accelerator device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device ordinal within its vendor family (CUDA index, etc.).
    pub ordinal: usize,
    pub kind: AcceleratorKind,
    /// Device memory in bytes (0 when the SMI tool could not report it).
    pub memory_bytes: u64,
    /// Compute capability, when the vendor exposes one.
    pub compute_capability: Option<ComputeCapability>,
}

/// Snapshot of the accelerator environment taken at orchestrator start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceleratorInfo {
    /// Detected devices. Always non-empty: the CPU fallback device is
    /// appended when no accelerator is found.
    pub devices: Vec<DeviceInfo>,
    /// Total system RAM in bytes.
    pub total_ram_bytes: u64,
    /// Available system RAM in bytes at detection time.
    pub available_ram_bytes: u64,
    /// Number of logical CPU cores.
    pub cpu_cores: usize,
}

impl AcceleratorInfo {
    /// Probe the host and return the detected device set.
    ///
    /// Runs synchronously - call from a blocking context or `spawn_blocking`.
    pub fn detect() -> Self {
        let mut devices = detect_cuda_devices();
        if devices.is_empty() {
            devices = detect_rocm_devices();
        }
        if devices.is_empty() {
            devices.push(DeviceInfo {
                ordinal: 0,
                kind: AcceleratorKind::Cpu,
                memory_bytes: 0,
                compute_capability: None,
            });
        }

        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        Self {
            devices,
            total_ram_bytes: sys.total_memory(),
            available_ram_bytes: sys.available_memory(),
            cpu_cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }

    /// Construct a fixed environment, bypassing probes. Used when the
    /// configuration overrides detection and by tests.
    pub fn fixed(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            total_ram_bytes: 0,
            available_ram_bytes: 0,
            cpu_cores: 1,
        }
    }

    /// The highest compute capability across detected devices, if any.
    pub fn best_compute_capability(&self) -> Option<ComputeCapability> {
        self.devices
            .iter()
            .filter_map(|d| d.compute_capability)
            .max()
    }
}

// ============================================================================
// Probe helpers
// ============================================================================

/// Enumerate NVIDIA devices.
///
/// Detection strategy:
/// 1. Check for `/dev/nvidia0` (kernel module loaded)
/// 2. Query `nvidia-smi --query-gpu=memory.total,compute_cap` per device
fn detect_cuda_devices() -> Vec<DeviceInfo> {
    if !Path::new("/dev/nvidia0").exists() {
        return Vec::new();
    }

    let output = std::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.total,compute_cap",
            "--format=csv,noheader,nounits",
        ])
        .output();

    let Ok(output) = output else {
        // Device node exists but nvidia-smi is missing. Report one CUDA
        // device with unknown memory so selection can still proceed.
        return vec![DeviceInfo {
            ordinal: 0,
            kind: AcceleratorKind::Cuda,
            memory_bytes: 0,
            compute_capability: None,
        }];
    };

    if !output.status.success() {
        return vec![DeviceInfo {
            ordinal: 0,
            kind: AcceleratorKind::Cuda,
            memory_bytes: 0,
            compute_capability: None,
        }];
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .enumerate()
        .map(|(ordinal, line)| {
            let mut cols = line.split(',');
            // nvidia-smi reports memory in MiB
            let memory_bytes = cols
                .next()
                .and_then(|c| c.trim().parse::<u64>().ok())
                .map(|mib| mib * 1024 * 1024)
                .unwrap_or(0);
            let compute_capability = cols.next().and_then(ComputeCapability::parse);
            DeviceInfo {
                ordinal,
                kind: AcceleratorKind::Cuda,
                memory_bytes,
                compute_capability,
            }
        })
        .collect()
}

/// Enumerate AMD devices.
///
/// Detection strategy:
/// 1. Check for `/dev/kfd` (AMD Kernel Fusion Driver - required for ROCm)
/// 2. Try `rocm-smi --showmeminfo vram --csv` for per-device VRAM
fn detect_rocm_devices() -> Vec<DeviceInfo> {
    if !Path::new("/dev/kfd").exists() {
        return Vec::new();
    }

    let output = std::process::Command::new("rocm-smi")
        .args(["--showmeminfo", "vram", "--csv"])
        .output();

    let Ok(output) = output else {
        return vec![DeviceInfo {
            ordinal: 0,
            kind: AcceleratorKind::Rocm,
            memory_bytes: 0,
            compute_capability: None,
        }];
    };

    if !output.status.success() {
        return vec![DeviceInfo {
            ordinal: 0,
            kind: AcceleratorKind::Rocm,
            memory_bytes: 0,
            compute_capability: None,
        }];
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    // rocm-smi CSV: GPU,VRAM Total Memory (B),VRAM Used Memory (B)
    let devices: Vec<DeviceInfo> = stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').collect();
            let memory_bytes = parts.get(1).and_then(|p| p.trim().parse::<u64>().ok())?;
            Some(memory_bytes)
        })
        .enumerate()
        .map(|(ordinal, memory_bytes)| DeviceInfo {
            ordinal,
            kind: AcceleratorKind::Rocm,
            memory_bytes,
            compute_capability: None,
        })
        .collect();

    if devices.is_empty() {
        vec![DeviceInfo {
            ordinal: 0,
            kind: AcceleratorKind::Rocm,
            memory_bytes: 0,
            compute_capability: None,
        }]
    } else {
        devices
    }
}

// ============================================================================
// Tests
// ============================================================================
