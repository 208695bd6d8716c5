//! Host capabilities reported by `ironpress info` and logged at startup

use serde::Serialize;
use sysinfo::{CpuExt, System, SystemExt};
use tracing::{info, warn};

/// Below this much free memory a batch of large images may thrash
const MIN_AVAILABLE_MEMORY_MB: u64 = 512;

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub cpu_cores: usize,
    pub physical_cores: Option<usize>,
    pub cpu_brand: Option<String>,
    pub total_memory_gb: f64,
    pub available_memory_gb: f64,
    pub os_name: String,
    pub os_version: Option<String>,
}

/// Snapshot of the host
pub fn system_info() -> SystemInfo {
    let mut system = System::new();
    system.refresh_memory();
    system.refresh_cpu();

    SystemInfo {
        cpu_cores: num_cpus::get(),
        physical_cores: system.physical_core_count(),
        cpu_brand: system
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty()),
        total_memory_gb: bytes_to_gb(system.total_memory()),
        available_memory_gb: bytes_to_gb(system.available_memory()),
        os_name: system.name().unwrap_or_else(|| std::env::consts::OS.to_string()),
        os_version: system.os_version(),
    }
}

/// Log the host capabilities and warn about low memory
pub fn log_system_requirements() -> SystemInfo {
    let info = system_info();

    let available_mb = (info.available_memory_gb * 1024.0) as u64;
    if available_mb < MIN_AVAILABLE_MEMORY_MB {
        warn!(
            "Low available memory: {}MB (recommended: >{}MB)",
            available_mb, MIN_AVAILABLE_MEMORY_MB
        );
    }

    info!(
        "Detected {} logical CPU cores, {:.1}GB memory on {}",
        info.cpu_cores, info.total_memory_gb, info.os_name
    );
    info
}

fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0 / 1024.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_info() {
        let info = system_info();
        assert!(info.cpu_cores >= 1);
        assert!(!info.os_name.is_empty());
        assert!(info.total_memory_gb >= info.available_memory_gb);
    }

    #[test]
    fn test_bytes_to_gb() {
        assert_eq!(bytes_to_gb(1024 * 1024 * 1024), 1.0);
    }
}
