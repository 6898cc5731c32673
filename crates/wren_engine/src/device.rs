//! Compute-target enumeration and selection.
//!
//! CPU is always present and always last in preference order. CUDA is
//! probed through cudarc when the `cuda` feature is on; Metal and WASM are
//! compile-target facts. Memory figures are best-effort and feed
//! diagnostics only, never scheduling.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Cuda,
    Metal,
    Wasm,
}

#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub device_type: DeviceType,
    pub device_id: usize,
    pub name: String,
    pub memory_total: u64,
    pub memory_available: u64,
}

impl DeviceInfo {
    /// Canonical device string: `cpu`, `cuda:<id>`, `mps`, `wasm`.
    pub fn device_string(&self) -> String {
        match self.device_type {
            DeviceType::Cpu => "cpu".to_string(),
            DeviceType::Cuda => format!("cuda:{}", self.device_id),
            DeviceType::Metal => "mps".to_string(),
            DeviceType::Wasm => "wasm".to_string(),
        }
    }

    fn cpu() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let (avail, total) = system_memory();
        Self {
            device_type: DeviceType::Cpu,
            device_id: 0,
            name: format!("CPU ({cores} cores)"),
            memory_total: total,
            memory_available: avail,
        }
    }
}

/// Returns (free, total) VRAM in bytes for a CUDA device, or None when the
/// driver is unavailable.
#[cfg(feature = "cuda")]
fn detect_cuda(device_id: usize) -> Option<DeviceInfo> {
    use cudarc::driver::CudaDevice;

    match CudaDevice::new(device_id) {
        Ok(_dev) => {
            use cudarc::driver::result::mem_get_info;
            let (free, total) = mem_get_info().ok()?;
            Some(DeviceInfo {
                device_type: DeviceType::Cuda,
                device_id,
                name: format!("CUDA device {device_id}"),
                memory_total: total as u64,
                memory_available: free as u64,
            })
        }
        Err(e) => {
            tracing::debug!("CUDA device {} unavailable: {:?}", device_id, e);
            None
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn detect_cuda(_device_id: usize) -> Option<DeviceInfo> {
    None
}

fn detect_metal() -> Option<DeviceInfo> {
    if cfg!(target_os = "macos") {
        Some(DeviceInfo {
            device_type: DeviceType::Metal,
            device_id: 0,
            name: "Apple Silicon GPU".to_string(),
            memory_total: 0,
            memory_available: 0,
        })
    } else {
        None
    }
}

fn detect_wasm() -> Option<DeviceInfo> {
    if cfg!(target_arch = "wasm32") {
        Some(DeviceInfo {
            device_type: DeviceType::Wasm,
            device_id: 0,
            name: "WebAssembly".to_string(),
            memory_total: 0,
            memory_available: 0,
        })
    } else {
        None
    }
}

/// All available targets, most-preferred first. CPU is the guaranteed tail.
pub fn detect_all() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();
    if let Some(cuda) = detect_cuda(0) {
        devices.push(cuda);
    }
    if let Some(metal) = detect_metal() {
        devices.push(metal);
    }
    if let Some(wasm) = detect_wasm() {
        devices.push(wasm);
    }
    devices.push(DeviceInfo::cpu());
    devices
}

/// Pick a device by preference token (`auto|cpu|cuda|metal|wasm`).
/// `auto` takes the most-preferred entry; unknown tokens fall back to CPU.
pub fn select(preference: &str) -> DeviceInfo {
    let devices = detect_all();
    if preference == "auto" {
        return devices.into_iter().next().expect("cpu always present");
    }

    let wanted = match preference.to_ascii_lowercase().as_str() {
        "cpu" => Some(DeviceType::Cpu),
        "cuda" => Some(DeviceType::Cuda),
        "metal" | "mps" => Some(DeviceType::Metal),
        "wasm" => Some(DeviceType::Wasm),
        other => {
            tracing::warn!("unknown device preference `{}`, using cpu", other);
            None
        }
    };

    if let Some(kind) = wanted {
        if let Some(found) = devices.iter().find(|d| d.device_type == kind) {
            return found.clone();
        }
    }
    DeviceInfo::cpu()
}

/// Validate a canonical device string: `cpu`, `cuda:<id>`, `mps`, `wasm`.
/// Anything outside the enumerated set is a config error.
pub fn validate_device_string(s: &str) -> Result<()> {
    let ok = matches!(s, "cpu" | "mps" | "wasm")
        || s.strip_prefix("cuda:")
            .is_some_and(|id| id.parse::<usize>().is_ok());
    if ok {
        Ok(())
    } else {
        Err(EngineError::config(format!("unknown device string: {s}")))
    }
}

// ============================================================
// Memory diagnostics
// ============================================================

#[derive(Clone, Debug, Default)]
pub struct MemoryStats {
    pub allocated: u64,
    pub peak: u64,
    pub device: String,
}

/// Tracks resident memory of this process for stat reporting. Linux reads
/// /proc/self/statm; other hosts report zero.
#[derive(Debug)]
pub struct MemoryTracker {
    device: String,
    peak: u64,
}

impl MemoryTracker {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            peak: 0,
        }
    }

    pub fn stats(&mut self) -> MemoryStats {
        let allocated = process_resident_bytes();
        if allocated > self.peak {
            self.peak = allocated;
        }
        MemoryStats {
            allocated,
            peak: self.peak,
            device: self.device.clone(),
        }
    }
}

#[cfg(target_os = "linux")]
fn process_resident_bytes() -> u64 {
    let page = 4096u64;
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| {
            s.split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok())
        })
        .map(|pages| pages * page)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn process_resident_bytes() -> u64 {
    0
}

#[cfg(target_os = "linux")]
fn system_memory() -> (u64, u64) {
    let content = match std::fs::read_to_string("/proc/meminfo") {
        Ok(c) => c,
        Err(_) => return (0, 0),
    };
    let mut total = 0u64;
    let mut avail = 0u64;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0),
            Some("MemAvailable:") => {
                avail = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0)
            }
            _ => {}
        }
    }
    (avail * 1024, total * 1024)
}

#[cfg(not(target_os = "linux"))]
fn system_memory() -> (u64, u64) {
    (0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_is_always_enumerated_last() {
        let devices = detect_all();
        assert!(!devices.is_empty());
        assert_eq!(devices.last().unwrap().device_type, DeviceType::Cpu);
    }

    #[test]
    fn unknown_preference_falls_back_to_cpu() {
        let device = select("tpu");
        assert_eq!(device.device_type, DeviceType::Cpu);
        assert_eq!(device.device_string(), "cpu");
    }

    #[test]
    fn auto_selects_first_entry() {
        let auto = select("auto");
        let all = detect_all();
        assert_eq!(auto.device_type, all[0].device_type);
    }

    #[test]
    fn device_string_validation() {
        assert!(validate_device_string("cpu").is_ok());
        assert!(validate_device_string("cuda:0").is_ok());
        assert!(validate_device_string("mps").is_ok());
        assert!(validate_device_string("wasm").is_ok());
        assert!(validate_device_string("cuda").is_err());
        assert!(validate_device_string("tpu").is_err());
    }

    #[test]
    fn canonical_strings() {
        let cuda = DeviceInfo {
            device_type: DeviceType::Cuda,
            device_id: 1,
            name: String::new(),
            memory_total: 0,
            memory_available: 0,
        };
        assert_eq!(cuda.device_string(), "cuda:1");
    }
}
