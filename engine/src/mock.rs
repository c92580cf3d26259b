use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use autocrawl_core::error::{Error, Result};

use crate::probes::{CpuProbe, MemoryProbe, MemoryUsage};
use crate::system_status::{ResourceLoad, StatusSource, SystemInfo};

/// A status source whose verdict is set by the test
pub struct ScriptedStatus {
    overloaded: AtomicBool,
}

impl ScriptedStatus {
    pub fn idle() -> Self {
        Self {
            overloaded: AtomicBool::new(false),
        }
    }

    pub fn overloaded() -> Self {
        let status = Self::idle();
        status.set_overloaded(true);
        status
    }

    pub fn set_overloaded(&self, overloaded: bool) {
        self.overloaded.store(overloaded, Ordering::SeqCst);
    }

    fn info(&self) -> SystemInfo {
        if !self.overloaded.load(Ordering::SeqCst) {
            return SystemInfo::idle();
        }

        SystemInfo {
            is_system_idle: false,
            cpu_info: ResourceLoad {
                is_overloaded: true,
                limit_ratio: 0.4,
                actual_ratio: 1.0,
                sample_count: 1,
            },
            ..SystemInfo::default()
        }
    }
}

#[async_trait]
impl StatusSource for ScriptedStatus {
    async fn current_status(&self) -> SystemInfo {
        self.info()
    }

    async fn historical_status(&self) -> SystemInfo {
        self.info()
    }
}

/// Probes returning fixed readings
pub struct FixedProbe {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub cpu: f64,
    pub failing: bool,
}

impl FixedProbe {
    pub fn new(used_bytes: u64, cpu: f64) -> Self {
        Self {
            used_bytes,
            total_bytes: used_bytes * 8,
            cpu,
            failing: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new(0, 0.0)
        }
    }
}

impl MemoryProbe for FixedProbe {
    fn memory_usage(&self) -> Result<MemoryUsage> {
        if self.failing {
            return Err(Error::other("memory probe unavailable"));
        }
        Ok(MemoryUsage {
            used_bytes: self.used_bytes,
            total_bytes: self.total_bytes,
        })
    }
}

impl CpuProbe for FixedProbe {
    fn cpu_usage(&self) -> Result<f64> {
        if self.failing {
            return Err(Error::other("cpu probe unavailable"));
        }
        Ok(self.cpu)
    }
}
