//! Host utilization sampling

use sysinfo::System;

/// Rolling sampler for host CPU and RAM utilization.
///
/// CPU usage is computed between consecutive refreshes, so the sampler is
/// kept alive across ticks of the stats reporter.
pub struct HostSampler {
    system: System,
}

impl HostSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self { system }
    }

    /// Sample `(cpu_util, ram_util)` as percentages.
    pub fn sample(&mut self) -> (f32, f32) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let cpu = self.system.global_cpu_usage();
        let total = self.system.total_memory();
        let ram = if total == 0 {
            0.0
        } else {
            self.system.used_memory() as f32 / total as f32 * 100.0
        };
        (cpu, ram)
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_in_range() {
        let mut sampler = HostSampler::new();
        let (cpu, ram) = sampler.sample();
        assert!((0.0..=100.0).contains(&cpu));
        assert!((0.0..=100.0).contains(&ram));
    }
}
