// Configuration types for the engine

use std::time::Duration;

use autocrawl_core::error::{ConfigError, Result};
use autocrawl_scheduler::QueueConfig;

fn check_ratio(field: &str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::new(field, format!("must be in (0, 1], got {}", value)).into())
    }
}

fn check_interval(field: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        Err(ConfigError::new(field, "must be longer than zero").into())
    } else {
        Ok(())
    }
}

/// Configuration for the resource snapshotter
#[derive(Debug, Clone)]
pub struct SnapshotterConfig {
    /// How often memory, CPU and client load are sampled
    pub snapshot_interval: Duration,

    /// How often the event loop lag probe runs
    pub event_loop_interval: Duration,

    /// Event loop lag above which the loop counts as overloaded
    pub max_blocked: Duration,

    /// Fraction of the memory limit above which memory counts as overloaded
    pub max_used_memory_ratio: f64,

    /// Memory available to the process; a quarter of total memory if unset
    pub memory_limit_bytes: Option<u64>,

    /// CPU utilization above which the CPU counts as overloaded
    pub max_used_cpu_ratio: f64,

    /// Share of failed storage calls above which the client counts as overloaded
    pub max_client_error_ratio: f64,

    /// How long snapshots are kept
    pub snapshot_history: Duration,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(1),
            event_loop_interval: Duration::from_millis(500),
            max_blocked: Duration::from_millis(50),
            max_used_memory_ratio: 0.7,
            memory_limit_bytes: None,
            max_used_cpu_ratio: 0.95,
            max_client_error_ratio: 0.3,
            snapshot_history: Duration::from_secs(30),
        }
    }
}

impl SnapshotterConfig {
    pub fn validate(&self) -> Result<()> {
        check_interval("snapshot_interval", self.snapshot_interval)?;
        check_interval("event_loop_interval", self.event_loop_interval)?;
        check_interval("snapshot_history", self.snapshot_history)?;
        check_ratio("max_used_memory_ratio", self.max_used_memory_ratio)?;
        check_ratio("max_used_cpu_ratio", self.max_used_cpu_ratio)?;
        check_ratio("max_client_error_ratio", self.max_client_error_ratio)?;
        if self.memory_limit_bytes == Some(0) {
            return Err(ConfigError::new("memory_limit_bytes", "must be positive").into());
        }
        Ok(())
    }
}

/// Thresholds of the system status evaluator
#[derive(Debug, Clone)]
pub struct SystemStatusConfig {
    /// Window of the current status
    pub current_history: Duration,

    /// Share of overloaded memory samples that makes memory overloaded
    pub max_memory_overloaded_ratio: f64,

    /// Share of overloaded event loop samples that makes the loop overloaded
    pub max_event_loop_overloaded_ratio: f64,

    /// Share of overloaded CPU samples that makes the CPU overloaded
    pub max_cpu_overloaded_ratio: f64,

    /// Share of overloaded client samples that makes the client overloaded
    pub max_client_overloaded_ratio: f64,
}

impl Default for SystemStatusConfig {
    fn default() -> Self {
        Self {
            current_history: Duration::from_secs(5),
            max_memory_overloaded_ratio: 0.2,
            max_event_loop_overloaded_ratio: 0.6,
            max_cpu_overloaded_ratio: 0.4,
            max_client_overloaded_ratio: 0.3,
        }
    }
}

impl SystemStatusConfig {
    pub fn validate(&self) -> Result<()> {
        check_interval("current_history", self.current_history)?;
        check_ratio("max_memory_overloaded_ratio", self.max_memory_overloaded_ratio)?;
        check_ratio(
            "max_event_loop_overloaded_ratio",
            self.max_event_loop_overloaded_ratio,
        )?;
        check_ratio("max_cpu_overloaded_ratio", self.max_cpu_overloaded_ratio)?;
        check_ratio("max_client_overloaded_ratio", self.max_client_overloaded_ratio)?;
        Ok(())
    }
}

/// Configuration for the autoscaled pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrency the pool never scales below
    pub min_concurrency: usize,

    /// Concurrency the pool never scales above
    pub max_concurrency: usize,

    /// Initial desired concurrency; `min_concurrency` if unset
    pub desired_concurrency: Option<usize>,

    /// Scale up only when at least this share of the desired concurrency is running
    pub desired_concurrency_ratio: f64,

    /// Fraction of the desired concurrency added per scale up
    pub scale_up_step_ratio: f64,

    /// Fraction of the desired concurrency removed per scale down
    pub scale_down_step_ratio: f64,

    /// How often the pool tries to start new tasks
    pub maybe_run_interval: Duration,

    /// How often the desired concurrency is adjusted
    pub autoscale_interval: Duration,

    /// How often the pool logs its state
    pub logging_interval: Duration,

    /// Upper bound on task starts per rolling minute
    pub max_tasks_per_minute: Option<usize>,

    /// Per-task timeout
    pub task_timeout: Option<Duration>,

    /// Abort the pool after this many failed tasks in a row
    pub max_consecutive_task_failures: Option<usize>,

    /// Stop after waiting this long for new work while nothing runs
    pub drain_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 200,
            desired_concurrency: None,
            desired_concurrency_ratio: 0.9,
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            maybe_run_interval: Duration::from_millis(500),
            autoscale_interval: Duration::from_secs(10),
            logging_interval: Duration::from_secs(60),
            max_tasks_per_minute: None,
            task_timeout: None,
            max_consecutive_task_failures: None,
            drain_timeout: None,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_concurrency == 0 {
            return Err(ConfigError::new("min_concurrency", "must be at least 1").into());
        }
        if self.max_concurrency < self.min_concurrency {
            return Err(ConfigError::new(
                "max_concurrency",
                format!(
                    "must not be lower than min_concurrency ({})",
                    self.min_concurrency
                ),
            )
            .into());
        }
        if let Some(desired) = self.desired_concurrency {
            if desired < self.min_concurrency || desired > self.max_concurrency {
                return Err(ConfigError::new(
                    "desired_concurrency",
                    format!(
                        "must be between {} and {}",
                        self.min_concurrency, self.max_concurrency
                    ),
                )
                .into());
            }
        }
        check_ratio("desired_concurrency_ratio", self.desired_concurrency_ratio)?;
        check_ratio("scale_up_step_ratio", self.scale_up_step_ratio)?;
        check_ratio("scale_down_step_ratio", self.scale_down_step_ratio)?;
        check_interval("maybe_run_interval", self.maybe_run_interval)?;
        check_interval("autoscale_interval", self.autoscale_interval)?;
        check_interval("logging_interval", self.logging_interval)?;
        if self.max_tasks_per_minute == Some(0) {
            return Err(ConfigError::new("max_tasks_per_minute", "must be positive").into());
        }
        if let Some(timeout) = self.task_timeout {
            check_interval("task_timeout", timeout)?;
        }
        if self.max_consecutive_task_failures == Some(0) {
            return Err(
                ConfigError::new("max_consecutive_task_failures", "must be positive").into(),
            );
        }
        Ok(())
    }

    /// Desired concurrency the pool starts with
    pub fn initial_desired_concurrency(&self) -> usize {
        self.desired_concurrency.unwrap_or(self.min_concurrency)
    }

    pub fn with_concurrency(mut self, min: usize, max: usize) -> Self {
        self.min_concurrency = min;
        self.max_concurrency = max;
        self
    }
}

/// Configuration for the basic crawler
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Retries per request before it is given up on
    pub max_request_retries: u32,

    /// Stop after this many requests were handled or given up on
    pub max_requests_per_crawl: Option<usize>,

    /// Timeout of one request handler call
    pub handle_request_timeout: Duration,

    /// Put retried requests at the head of the queue
    pub retry_forefront: bool,

    /// Pool settings
    pub pool: PoolConfig,

    /// Snapshotter settings, used when no status source is supplied
    pub snapshotter: SnapshotterConfig,

    /// Evaluator settings, used when no status source is supplied
    pub system_status: SystemStatusConfig,

    /// Queue settings, used by [`crate::BasicCrawler::open`]
    pub queue: QueueConfig,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_request_retries: 3,
            max_requests_per_crawl: None,
            handle_request_timeout: Duration::from_secs(60),
            retry_forefront: false,
            pool: PoolConfig::default(),
            snapshotter: SnapshotterConfig::default(),
            system_status: SystemStatusConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl CrawlerConfig {
    pub fn validate(&self) -> Result<()> {
        check_interval("handle_request_timeout", self.handle_request_timeout)?;
        if self.max_requests_per_crawl == Some(0) {
            return Err(ConfigError::new("max_requests_per_crawl", "must be positive").into());
        }
        self.pool.validate()?;
        self.snapshotter.validate()?;
        self.system_status.validate()?;
        self.queue.validate()
    }
}
