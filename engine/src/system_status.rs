use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SystemStatusConfig;
use crate::snapshotter::{ResourceKind, Snapshot, Snapshotter};

/// Load verdict for one resource
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceLoad {
    pub is_overloaded: bool,
    /// Share of overloaded samples tolerated before the resource is overloaded
    pub limit_ratio: f64,
    /// Share of overloaded samples observed
    pub actual_ratio: f64,
    pub sample_count: usize,
}

/// Aggregated verdict over all resources
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    pub is_system_idle: bool,
    pub memory_info: ResourceLoad,
    pub event_loop_info: ResourceLoad,
    pub cpu_info: ResourceLoad,
    pub client_info: ResourceLoad,
}

impl SystemInfo {
    /// A verdict with every resource healthy
    pub fn idle() -> Self {
        Self {
            is_system_idle: true,
            ..Self::default()
        }
    }

    pub fn load(&self, kind: ResourceKind) -> &ResourceLoad {
        match kind {
            ResourceKind::Memory => &self.memory_info,
            ResourceKind::EventLoop => &self.event_loop_info,
            ResourceKind::Cpu => &self.cpu_info,
            ResourceKind::Client => &self.client_info,
        }
    }

    /// Resources currently judged overloaded
    pub fn overloaded(&self) -> Vec<ResourceKind> {
        ResourceKind::ALL
            .into_iter()
            .filter(|kind| self.load(*kind).is_overloaded)
            .collect()
    }
}

/// Source of the overload verdicts the pool scales on
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    /// Verdict over the most recent samples
    async fn current_status(&self) -> SystemInfo;

    /// Verdict over the whole retained history
    async fn historical_status(&self) -> SystemInfo;
}

/// Judge one resource. A resource with no samples is healthy.
pub fn evaluate(samples: &[Snapshot], limit_ratio: f64) -> ResourceLoad {
    let sample_count = samples.len();
    let actual_ratio = if sample_count == 0 {
        0.0
    } else {
        let overloaded = samples.iter().filter(|s| s.is_overloaded).count();
        overloaded as f64 / sample_count as f64
    };

    ResourceLoad {
        is_overloaded: actual_ratio > limit_ratio,
        limit_ratio,
        actual_ratio,
        sample_count,
    }
}

/// Turns snapshot histories into overload verdicts
pub struct SystemStatus {
    snapshotter: Arc<Snapshotter>,
    config: SystemStatusConfig,
}

impl SystemStatus {
    pub fn new(snapshotter: Arc<Snapshotter>, config: SystemStatusConfig) -> Self {
        Self {
            snapshotter,
            config,
        }
    }

    pub fn snapshotter(&self) -> &Arc<Snapshotter> {
        &self.snapshotter
    }

    fn limit_ratio(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Memory => self.config.max_memory_overloaded_ratio,
            ResourceKind::EventLoop => self.config.max_event_loop_overloaded_ratio,
            ResourceKind::Cpu => self.config.max_cpu_overloaded_ratio,
            ResourceKind::Client => self.config.max_client_overloaded_ratio,
        }
    }

    async fn status(&self, recent_only: bool) -> SystemInfo {
        let mut loads = [ResourceLoad::default(); 4];
        for (slot, kind) in loads.iter_mut().zip(ResourceKind::ALL) {
            let samples = if recent_only {
                self.snapshotter
                    .get_sample_since(kind, self.config.current_history)
                    .await
            } else {
                self.snapshotter.get_sample(kind, None).await
            };
            *slot = evaluate(&samples, self.limit_ratio(kind));
        }

        let [memory_info, event_loop_info, cpu_info, client_info] = loads;
        SystemInfo {
            is_system_idle: loads.iter().all(|load| !load.is_overloaded),
            memory_info,
            event_loop_info,
            cpu_info,
            client_info,
        }
    }
}

#[async_trait]
impl StatusSource for SystemStatus {
    async fn current_status(&self) -> SystemInfo {
        self.status(true).await
    }

    async fn historical_status(&self) -> SystemInfo {
        self.status(false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn samples(flags: &[bool]) -> Vec<Snapshot> {
        let now = Instant::now();
        flags
            .iter()
            .map(|&is_overloaded| Snapshot {
                created_at: now,
                is_overloaded,
                raw_value: 0.0,
            })
            .collect()
    }

    #[test]
    fn test_no_samples_is_healthy() {
        let load = evaluate(&[], 0.2);
        assert!(!load.is_overloaded);
        assert_eq!(load.sample_count, 0);
        assert_eq!(load.actual_ratio, 0.0);
    }

    #[test]
    fn test_ratio_must_exceed_limit() {
        // 1 of 5 overloaded equals the limit, which is still fine
        let load = evaluate(&samples(&[true, false, false, false, false]), 0.2);
        assert!(!load.is_overloaded);
        assert!((load.actual_ratio - 0.2).abs() < f64::EPSILON);

        let load = evaluate(&samples(&[true, true, false, false, false]), 0.2);
        assert!(load.is_overloaded);
        assert_eq!(load.sample_count, 5);
    }
}
