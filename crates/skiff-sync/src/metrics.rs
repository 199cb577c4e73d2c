use std::sync::Mutex;

use serde::Serialize;
use sysinfo::{ComponentExt, CpuExt, System, SystemExt};

/// Minimum metric set reported to the cloud. Additional keys may be added
/// without breaking the report contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemMetrics {
    /// Aggregate CPU utilisation, percent.
    pub cpu_usage: f32,
    /// Used memory, bytes.
    pub memory_usage: u64,
    pub memory_total: u64,
    /// Hottest thermal sensor, °C, when the platform exposes one.
    pub temperature: Option<f32>,
    /// Seconds since boot.
    pub uptime: u64,
    pub load_avg_1m: f64,
}

/// OS sampler over sysinfo. Refreshing mutates the `System`, so it sits
/// behind a mutex and hands out value snapshots.
pub struct MetricsSampler {
    sys: Mutex<System>,
}

impl MetricsSampler {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }

    pub fn sample(&self) -> SystemMetrics {
        let mut sys = self.sys.lock().unwrap();
        sys.refresh_cpu();
        sys.refresh_memory();
        sys.refresh_components_list();
        sys.refresh_components();

        let temperature = sys
            .components()
            .iter()
            .map(|c| c.temperature())
            .fold(None, |acc: Option<f32>, t| {
                Some(acc.map_or(t, |a| a.max(t)))
            });

        SystemMetrics {
            cpu_usage: sys.global_cpu_info().cpu_usage(),
            memory_usage: sys.used_memory(),
            memory_total: sys.total_memory(),
            temperature,
            uptime: sys.uptime(),
            load_avg_1m: sys.load_average().one,
        }
    }
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_is_plausible() {
        let sampler = MetricsSampler::new();
        let m = sampler.sample();
        assert!(m.memory_total > 0);
        assert!(m.memory_usage <= m.memory_total);
        assert!(m.cpu_usage >= 0.0);
    }

    #[test]
    fn serializes_with_the_contract_keys() {
        let m = SystemMetrics {
            cpu_usage: 12.5,
            memory_usage: 1024,
            memory_total: 2048,
            temperature: Some(48.0),
            uptime: 3600,
            load_avg_1m: 0.5,
        };
        let json = serde_json::to_value(&m).unwrap();
        for key in [
            "cpu_usage",
            "memory_usage",
            "memory_total",
            "temperature",
            "uptime",
            "load_avg_1m",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }
}
