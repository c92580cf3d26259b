use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};

use autocrawl_core::client_load::{ClientLoad, ClientLoadCounters};
use autocrawl_core::error::Result;

use crate::config::SnapshotterConfig;
use crate::probes::{CpuProbe, MemoryProbe, SysinfoProbe};

/// A resource watched by the snapshotter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    EventLoop,
    Cpu,
    Client,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Memory,
        ResourceKind::EventLoop,
        ResourceKind::Cpu,
        ResourceKind::Client,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Memory => write!(f, "memory"),
            ResourceKind::EventLoop => write!(f, "event_loop"),
            ResourceKind::Cpu => write!(f, "cpu"),
            ResourceKind::Client => write!(f, "client"),
        }
    }
}

/// One observation of a resource.
///
/// `raw_value` is the used share of the memory limit, the event loop lag in
/// milliseconds, the CPU utilization, or the client error ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub created_at: Instant,
    pub is_overloaded: bool,
    pub raw_value: f64,
}

#[derive(Debug, Default)]
struct History {
    memory: VecDeque<Snapshot>,
    event_loop: VecDeque<Snapshot>,
    cpu: VecDeque<Snapshot>,
    client: VecDeque<Snapshot>,
}

impl History {
    fn series(&self, kind: ResourceKind) -> &VecDeque<Snapshot> {
        match kind {
            ResourceKind::Memory => &self.memory,
            ResourceKind::EventLoop => &self.event_loop,
            ResourceKind::Cpu => &self.cpu,
            ResourceKind::Client => &self.client,
        }
    }

    fn series_mut(&mut self, kind: ResourceKind) -> &mut VecDeque<Snapshot> {
        match kind {
            ResourceKind::Memory => &mut self.memory,
            ResourceKind::EventLoop => &mut self.event_loop,
            ResourceKind::Cpu => &mut self.cpu,
            ResourceKind::Client => &mut self.client,
        }
    }

    fn record(&mut self, kind: ResourceKind, snapshot: Snapshot, keep: Duration) {
        let series = self.series_mut(kind);
        series.push_back(snapshot);

        // series are ordered by creation, so eviction only looks at the front
        while let Some(oldest) = series.front() {
            if snapshot.created_at.saturating_duration_since(oldest.created_at) > keep {
                series.pop_front();
            } else {
                break;
            }
        }
    }
}

/// State shared between the snapshotter and its sampling tasks
#[derive(Clone)]
struct Sampler {
    config: SnapshotterConfig,
    memory_probe: Arc<dyn MemoryProbe>,
    cpu_probe: Arc<dyn CpuProbe>,
    client_load: Arc<ClientLoad>,
    history: Arc<RwLock<History>>,
}

impl Sampler {
    async fn record(&self, kind: ResourceKind, is_overloaded: bool, raw_value: f64) {
        let snapshot = Snapshot {
            created_at: Instant::now(),
            is_overloaded,
            raw_value,
        };
        self.history
            .write()
            .await
            .record(kind, snapshot, self.config.snapshot_history);
    }

    async fn sample_memory(&self) {
        match self.memory_probe.memory_usage() {
            Ok(usage) => {
                let limit = self
                    .config
                    .memory_limit_bytes
                    .unwrap_or(usage.total_bytes / 4)
                    .max(1);
                let ratio = usage.used_bytes as f64 / limit as f64;
                if ratio > 1.0 {
                    warn!(
                        "Memory usage {}MB exceeds the limit of {}MB",
                        usage.used_bytes / 1024 / 1024,
                        limit / 1024 / 1024
                    );
                }
                self.record(
                    ResourceKind::Memory,
                    ratio > self.config.max_used_memory_ratio,
                    ratio,
                )
                .await;
            }
            Err(e) => warn!("Failed to sample memory usage: {}", e),
        }
    }

    async fn sample_cpu(&self) {
        match self.cpu_probe.cpu_usage() {
            Ok(usage) => {
                self.record(
                    ResourceKind::Cpu,
                    usage > self.config.max_used_cpu_ratio,
                    usage,
                )
                .await;
            }
            Err(e) => warn!("Failed to sample CPU usage: {}", e),
        }
    }

    async fn sample_client(&self, last: ClientLoadCounters) -> ClientLoadCounters {
        let counters = self.client_load.counters();
        let ratio = counters.delta_since(&last).error_ratio();
        self.record(
            ResourceKind::Client,
            ratio > self.config.max_client_error_ratio,
            ratio,
        )
        .await;
        counters
    }
}

fn spawn_resource_sampler(sampler: Sampler, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(sampler.config.snapshot_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_client = sampler.client_load.counters();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    sampler.sample_memory().await;
                    sampler.sample_cpu().await;
                    last_client = sampler.sample_client(last_client).await;
                }
            }
        }
    })
}

fn spawn_event_loop_probe(sampler: Sampler, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = sampler.config.event_loop_interval;

        loop {
            let started = Instant::now();
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(period) => {
                    let lag = started.elapsed().saturating_sub(period);
                    let is_overloaded = lag > sampler.config.max_blocked;
                    if is_overloaded {
                        debug!("Event loop lagged by {:?}", lag);
                    }
                    sampler
                        .record(ResourceKind::EventLoop, is_overloaded, lag.as_secs_f64() * 1000.0)
                        .await;
                }
            }
        }
    })
}

struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Periodically samples memory, event loop lag, CPU and client load
/// into bounded histories.
pub struct Snapshotter {
    sampler: Sampler,
    running: Mutex<Option<Running>>,
}

impl Snapshotter {
    /// Create a snapshotter reading the current process through `sysinfo`
    pub fn new(config: SnapshotterConfig) -> Result<Self> {
        config.validate()?;
        let probe = Arc::new(SysinfoProbe::new());

        Ok(Self {
            sampler: Sampler {
                config,
                memory_probe: probe.clone(),
                cpu_probe: probe,
                client_load: Arc::new(ClientLoad::new()),
                history: Arc::new(RwLock::new(History::default())),
            },
            running: Mutex::new(None),
        })
    }

    /// Replace the memory and CPU probes
    pub fn with_probes(mut self, memory: Arc<dyn MemoryProbe>, cpu: Arc<dyn CpuProbe>) -> Self {
        self.sampler.memory_probe = memory;
        self.sampler.cpu_probe = cpu;
        self
    }

    /// Watch the given storage client counters
    pub fn with_client_load(mut self, client_load: Arc<ClientLoad>) -> Self {
        self.sampler.client_load = client_load;
        self
    }

    pub fn client_load(&self) -> Arc<ClientLoad> {
        self.sampler.client_load.clone()
    }

    pub fn config(&self) -> &SnapshotterConfig {
        &self.sampler.config
    }

    /// Start sampling. Calling it again while running does nothing.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let (shutdown, receiver) = watch::channel(false);
        let handles = vec![
            spawn_resource_sampler(self.sampler.clone(), receiver.clone()),
            spawn_event_loop_probe(self.sampler.clone(), receiver),
        ];
        *running = Some(Running { shutdown, handles });

        info!("Snapshotter started");
    }

    /// Stop sampling and wait for the sampling tasks to exit
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.shutdown.send_replace(true);
        for handle in running.handles {
            if let Err(e) = handle.await {
                warn!("Snapshotter task ended abnormally: {}", e);
            }
        }

        info!("Snapshotter stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Record an externally measured snapshot
    pub async fn record(&self, kind: ResourceKind, is_overloaded: bool, raw_value: f64) {
        self.sampler.record(kind, is_overloaded, raw_value).await;
    }

    /// The most recent `limit` snapshots of a resource, oldest first.
    /// Without a limit the whole retained history is returned.
    pub async fn get_sample(&self, kind: ResourceKind, limit: Option<usize>) -> Vec<Snapshot> {
        let history = self.sampler.history.read().await;
        let series = history.series(kind);
        let skip = limit.map_or(0, |limit| series.len().saturating_sub(limit));
        series.iter().skip(skip).copied().collect()
    }

    /// Snapshots of a resource taken within the last `window`, oldest first
    pub async fn get_sample_since(&self, kind: ResourceKind, window: Duration) -> Vec<Snapshot> {
        let now = Instant::now();
        let history = self.sampler.history.read().await;
        history
            .series(kind)
            .iter()
            .filter(|snapshot| now.saturating_duration_since(snapshot.created_at) <= window)
            .copied()
            .collect()
    }
}
