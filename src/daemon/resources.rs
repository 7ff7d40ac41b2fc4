//! Resource oracle gating worker admission
//!
//! Workers only start when the machine has headroom: 1-minute load
//! average (normalized per logical core) under `max_cpu_load` and free
//! memory above `min_free_memory_percent`. The oracle is a trait so
//! tests substitute deterministic readings.

use crate::config::ResourceThresholds;
use std::sync::Mutex;
use sysinfo::System;

/// Point-in-time resource reading
#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    /// 1-minute load average divided by logical core count
    pub cpu_load_per_core: f64,

    /// Free memory as a percentage of total
    pub free_memory_percent: f64,
}

/// Source of resource readings
pub trait ResourceOracle: Send + Sync {
    fn snapshot(&self) -> ResourceSnapshot;
}

/// Live readings via sysinfo
pub struct SysinfoOracle {
    system: Mutex<System>,
}

impl SysinfoOracle {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceOracle for SysinfoOracle {
    fn snapshot(&self) -> ResourceSnapshot {
        let mut system = self.system.lock().expect("oracle poisoned");
        system.refresh_memory();

        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        let load = System::load_average().one / cores;

        let total = system.total_memory() as f64;
        let free_percent = if total > 0.0 {
            system.available_memory() as f64 / total * 100.0
        } else {
            100.0
        };

        ResourceSnapshot {
            cpu_load_per_core: load,
            free_memory_percent: free_percent,
        }
    }
}

/// Fixed readings for tests and for disabling the gate
pub struct StaticOracle {
    pub snapshot: ResourceSnapshot,
}

impl ResourceOracle for StaticOracle {
    fn snapshot(&self) -> ResourceSnapshot {
        self.snapshot
    }
}

/// Check a reading against the admission thresholds
///
/// Returns the refusal reason when either gate trips.
pub fn admit(
    snapshot: &ResourceSnapshot,
    thresholds: &ResourceThresholds,
) -> Result<(), String> {
    if snapshot.cpu_load_per_core > thresholds.max_cpu_load {
        return Err(format!(
            "cpu load {:.2} over limit {:.2}",
            snapshot.cpu_load_per_core, thresholds.max_cpu_load
        ));
    }
    if snapshot.free_memory_percent < thresholds.min_free_memory_percent {
        return Err(format!(
            "free memory {:.1}% under limit {:.1}%",
            snapshot.free_memory_percent, thresholds.min_free_memory_percent
        ));
    }
    Ok(())
}
