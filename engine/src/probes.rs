use std::sync::Mutex;

use sysinfo::{Pid, System};

use autocrawl_core::error::{Error, Result};

/// Memory usage of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Resident memory of the process in bytes
    pub used_bytes: u64,
    /// Total memory of the machine in bytes
    pub total_bytes: u64,
}

/// Reads the memory used by the process
pub trait MemoryProbe: Send + Sync + 'static {
    fn memory_usage(&self) -> Result<MemoryUsage>;
}

/// Reads the CPU utilization as a ratio between 0 and 1
pub trait CpuProbe: Send + Sync + 'static {
    fn cpu_usage(&self) -> Result<f64>;
}

/// Probes backed by `sysinfo`
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Pid,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();

        Self {
            system: Mutex::new(system),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    fn with_system<T>(&self, f: impl FnOnce(&mut System) -> Result<T>) -> Result<T> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| Error::other("system probe lock poisoned"))?;
        f(&mut system)
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn memory_usage(&self) -> Result<MemoryUsage> {
        let pid = self.pid;
        self.with_system(|system| {
            system.refresh_memory();
            if !system.refresh_process(pid) {
                return Err(Error::other(format!("process {} not found", pid)));
            }
            let process = system
                .process(pid)
                .ok_or_else(|| Error::other(format!("process {} not found", pid)))?;

            Ok(MemoryUsage {
                used_bytes: process.memory(),
                total_bytes: system.total_memory(),
            })
        })
    }
}

impl CpuProbe for SysinfoProbe {
    fn cpu_usage(&self) -> Result<f64> {
        self.with_system(|system| {
            system.refresh_cpu();
            let usage = f64::from(system.global_cpu_info().cpu_usage()) / 100.0;
            Ok(usage.clamp(0.0, 1.0))
        })
    }
}
