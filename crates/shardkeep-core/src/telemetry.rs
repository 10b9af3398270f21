//! Host resource telemetry.
//!
//! Memory tiers, preload gates and proactive unloading all read from a
//! [`ResourceProbe`]. The default probe samples the host through `sysinfo`;
//! hosts that already collect telemetry can push values into a [`StaticProbe`].

use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

/// Source of CPU and memory readings.
pub trait ResourceProbe: Send + Sync {
    /// Global CPU usage in percent (0-100).
    fn cpu_percent(&self) -> f32;

    /// Used system memory in percent (0-100).
    fn memory_percent(&self) -> f32;

    /// Available system memory in bytes.
    fn available_memory_bytes(&self) -> u64;

    /// Used accelerator memory in percent, when an accelerator is present.
    fn gpu_memory_percent(&self) -> Option<f32> {
        None
    }
}

/// Probe backed by `sysinfo`.
///
/// CPU usage needs two refreshes to produce a delta, so the first reading is 0.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_memory(MemoryRefreshKind::everything())
                .with_cpu(CpuRefreshKind::new().with_cpu_usage()),
        );
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn cpu_percent(&self) -> f32 {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.global_cpu_info().cpu_usage()
    }

    fn memory_percent(&self) -> f32 {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        let used = total.saturating_sub(system.available_memory());
        (used as f64 / total as f64 * 100.0) as f32
    }

    fn available_memory_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.available_memory()
    }
}

/// Probe returning values set by the caller.
#[derive(Debug, Clone)]
pub struct StaticProbe {
    readings: Arc<Mutex<Readings>>,
}

#[derive(Debug, Clone, Copy)]
struct Readings {
    cpu: f32,
    memory: f32,
    available: u64,
    gpu: Option<f32>,
}

impl StaticProbe {
    pub fn new(cpu_percent: f32, memory_percent: f32, available_memory_bytes: u64) -> Self {
        Self {
            readings: Arc::new(Mutex::new(Readings {
                cpu: cpu_percent,
                memory: memory_percent,
                available: available_memory_bytes,
                gpu: None,
            })),
        }
    }

    pub fn set_cpu_percent(&self, value: f32) {
        self.readings.lock().cpu = value;
    }

    pub fn set_memory_percent(&self, value: f32) {
        self.readings.lock().memory = value;
    }

    pub fn set_available_memory_bytes(&self, value: u64) {
        self.readings.lock().available = value;
    }

    pub fn set_gpu_memory_percent(&self, value: Option<f32>) {
        self.readings.lock().gpu = value;
    }
}

impl ResourceProbe for StaticProbe {
    fn cpu_percent(&self) -> f32 {
        self.readings.lock().cpu
    }

    fn memory_percent(&self) -> f32 {
        self.readings.lock().memory
    }

    fn available_memory_bytes(&self) -> u64 {
        self.readings.lock().available
    }

    fn gpu_memory_percent(&self) -> Option<f32> {
        self.readings.lock().gpu
    }
}

/// Shared default probe.
pub fn system_probe() -> Arc<dyn ResourceProbe> {
    Arc::new(SysinfoProbe::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_probe_updates_are_shared() {
        let probe = StaticProbe::new(10.0, 40.0, 1024);
        let view = probe.clone();
        probe.set_memory_percent(91.5);
        probe.set_gpu_memory_percent(Some(12.0));
        assert_eq!(view.memory_percent(), 91.5);
        assert_eq!(view.gpu_memory_percent(), Some(12.0));
        assert_eq!(view.available_memory_bytes(), 1024);
    }

    #[test]
    fn test_sysinfo_probe_reports_sane_ranges() {
        let probe = SysinfoProbe::new();
        let memory = probe.memory_percent();
        assert!((0.0..=100.0).contains(&memory));
        assert!(probe.cpu_percent() >= 0.0);
    }
}
