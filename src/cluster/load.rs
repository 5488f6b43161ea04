//! Local load sampling for the health endpoint and the node table.

use parking_lot::Mutex;
use sysinfo::System;

/// Samples CPU and memory utilization.
pub struct LoadSampler {
    system: Mutex<System>,
}

impl LoadSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }

    /// Average of CPU and memory utilization, 0-100.
    ///
    /// CPU usage is measured since the previous call, so the first sample
    /// after startup may read low.
    pub fn sample(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();

        let cpu = system.global_cpu_info().cpu_usage() as f64;
        let total = system.total_memory();
        let memory = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64 * 100.0
        };

        ((cpu + memory) / 2.0).clamp(0.0, 100.0)
    }
}

impl Default for LoadSampler {
    fn default() -> Self {
        Self::new()
    }
}
