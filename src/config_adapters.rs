use std::path::PathBuf;
use std::time::Duration;

use crate::settings::{Result, Settings};
use autocrawl_engine::{CrawlerConfig, PoolConfig, SnapshotterConfig, SystemStatusConfig};
use autocrawl_scheduler::{QueueConfig, RequestQueue};
use autocrawl_storage::{StorageBackend, StorageConfig, StorageContext};

fn millis(settings: &Settings, key: &str, default: Duration) -> Result<Duration> {
    Ok(settings
        .get_opt::<u64>(key)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}

fn optional_millis(settings: &Settings, key: &str) -> Result<Option<Duration>> {
    Ok(settings.get_opt::<u64>(key)?.map(Duration::from_millis))
}

fn value<T: for<'de> serde::Deserialize<'de>>(
    settings: &Settings,
    key: &str,
    default: T,
) -> Result<T> {
    Ok(settings.get_opt(key)?.unwrap_or(default))
}

/// Adapter function to create PoolConfig from Settings
pub fn pool_config_from_settings(settings: &Settings) -> Result<PoolConfig> {
    let defaults = PoolConfig::default();
    Ok(PoolConfig {
        min_concurrency: value(settings, "MIN_CONCURRENCY", defaults.min_concurrency)?,
        max_concurrency: value(settings, "MAX_CONCURRENCY", defaults.max_concurrency)?,
        desired_concurrency: settings.get_opt("DESIRED_CONCURRENCY")?,
        desired_concurrency_ratio: value(
            settings,
            "DESIRED_CONCURRENCY_RATIO",
            defaults.desired_concurrency_ratio,
        )?,
        scale_up_step_ratio: value(settings, "SCALE_UP_STEP_RATIO", defaults.scale_up_step_ratio)?,
        scale_down_step_ratio: value(
            settings,
            "SCALE_DOWN_STEP_RATIO",
            defaults.scale_down_step_ratio,
        )?,
        maybe_run_interval: millis(settings, "MAYBE_RUN_INTERVAL_MS", defaults.maybe_run_interval)?,
        autoscale_interval: millis(settings, "AUTOSCALE_INTERVAL_MS", defaults.autoscale_interval)?,
        logging_interval: millis(settings, "LOGGING_INTERVAL_MS", defaults.logging_interval)?,
        max_tasks_per_minute: settings.get_opt("MAX_TASKS_PER_MINUTE")?,
        task_timeout: optional_millis(settings, "TASK_TIMEOUT_MS")?,
        max_consecutive_task_failures: settings.get_opt("MAX_CONSECUTIVE_TASK_FAILURES")?,
        drain_timeout: optional_millis(settings, "DRAIN_TIMEOUT_MS")?,
    })
}

/// Adapter function to create SnapshotterConfig from Settings
pub fn snapshotter_config_from_settings(settings: &Settings) -> Result<SnapshotterConfig> {
    let defaults = SnapshotterConfig::default();
    Ok(SnapshotterConfig {
        snapshot_interval: millis(settings, "SNAPSHOT_INTERVAL_MS", defaults.snapshot_interval)?,
        event_loop_interval: millis(
            settings,
            "EVENT_LOOP_INTERVAL_MS",
            defaults.event_loop_interval,
        )?,
        max_blocked: millis(settings, "MAX_BLOCKED_MS", defaults.max_blocked)?,
        max_used_memory_ratio: value(
            settings,
            "MAX_USED_MEMORY_RATIO",
            defaults.max_used_memory_ratio,
        )?,
        memory_limit_bytes: settings.get_opt("MEMORY_LIMIT_BYTES")?,
        max_used_cpu_ratio: value(settings, "MAX_USED_CPU_RATIO", defaults.max_used_cpu_ratio)?,
        max_client_error_ratio: value(
            settings,
            "MAX_CLIENT_ERROR_RATIO",
            defaults.max_client_error_ratio,
        )?,
        snapshot_history: millis(settings, "SNAPSHOT_HISTORY_MS", defaults.snapshot_history)?,
    })
}

/// Adapter function to create SystemStatusConfig from Settings
pub fn system_status_config_from_settings(settings: &Settings) -> Result<SystemStatusConfig> {
    let defaults = SystemStatusConfig::default();
    Ok(SystemStatusConfig {
        current_history: millis(settings, "CURRENT_HISTORY_MS", defaults.current_history)?,
        max_memory_overloaded_ratio: value(
            settings,
            "MAX_MEMORY_OVERLOADED_RATIO",
            defaults.max_memory_overloaded_ratio,
        )?,
        max_event_loop_overloaded_ratio: value(
            settings,
            "MAX_EVENT_LOOP_OVERLOADED_RATIO",
            defaults.max_event_loop_overloaded_ratio,
        )?,
        max_cpu_overloaded_ratio: value(
            settings,
            "MAX_CPU_OVERLOADED_RATIO",
            defaults.max_cpu_overloaded_ratio,
        )?,
        max_client_overloaded_ratio: value(
            settings,
            "MAX_CLIENT_OVERLOADED_RATIO",
            defaults.max_client_overloaded_ratio,
        )?,
    })
}

/// Adapter function to create QueueConfig from Settings
pub fn queue_config_from_settings(settings: &Settings) -> Result<QueueConfig> {
    let defaults = QueueConfig::default();
    let config = QueueConfig {
        head_min_length: value(settings, "HEAD_MIN_LENGTH", defaults.head_min_length)?,
        head_buffer_factor: value(settings, "HEAD_BUFFER_FACTOR", defaults.head_buffer_factor)?,
        recently_handled_capacity: value(
            settings,
            "RECENTLY_HANDLED_CAPACITY",
            defaults.recently_handled_capacity,
        )?,
        requests_cache_capacity: value(
            settings,
            "REQUESTS_CACHE_CAPACITY",
            defaults.requests_cache_capacity,
        )?,
        consistency_delay: millis(settings, "CONSISTENCY_DELAY_MS", defaults.consistency_delay)?,
    };
    config.validate()?;
    Ok(config)
}

/// Adapter function to create a validated CrawlerConfig from Settings
pub fn crawler_config_from_settings(settings: &Settings) -> Result<CrawlerConfig> {
    let defaults = CrawlerConfig::default();
    let config = CrawlerConfig {
        max_request_retries: value(settings, "MAX_REQUEST_RETRIES", defaults.max_request_retries)?,
        max_requests_per_crawl: settings.get_opt("MAX_REQUESTS_PER_CRAWL")?,
        handle_request_timeout: millis(
            settings,
            "HANDLE_REQUEST_TIMEOUT_MS",
            defaults.handle_request_timeout,
        )?,
        retry_forefront: value(settings, "RETRY_FOREFRONT", defaults.retry_forefront)?,
        pool: pool_config_from_settings(settings)?,
        snapshotter: snapshotter_config_from_settings(settings)?,
        system_status: system_status_config_from_settings(settings)?,
        queue: queue_config_from_settings(settings)?,
    };
    config.validate()?;
    Ok(config)
}

/// Adapter function to create StorageConfig from Settings.
///
/// `STORAGE_DIR` selects the file backend; without it queues live in memory.
pub fn storage_config_from_settings(settings: &Settings) -> Result<StorageConfig> {
    let backend = match settings.get_opt::<PathBuf>("STORAGE_DIR")? {
        Some(root) => StorageBackend::File { root },
        None => StorageBackend::Memory,
    };
    Ok(StorageConfig {
        backend,
        purge_on_start: value(settings, "PURGE_ON_START", StorageConfig::default().purge_on_start)?,
    })
}

/// Queue to use: `name` overrides `QUEUE_NAME`, and `None` means the
/// default queue
pub fn queue_name_from_settings(settings: &Settings, name: Option<&str>) -> Result<Option<String>> {
    match name {
        Some(name) => Ok(Some(name.to_string())),
        None => settings.get_opt("QUEUE_NAME"),
    }
}

/// Adapter function to open a request queue configured from Settings
pub async fn open_queue_from_settings(
    context: &StorageContext,
    settings: &Settings,
    name: Option<&str>,
) -> Result<RequestQueue> {
    let name = queue_name_from_settings(settings, name)?;
    let config = queue_config_from_settings(settings)?;
    Ok(RequestQueue::open(context, name.as_deref(), config).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsError;

    #[test]
    fn test_defaults_without_settings() {
        let config = crawler_config_from_settings(&Settings::new()).unwrap();
        assert_eq!(config.max_request_retries, 3);
        assert_eq!(config.pool.min_concurrency, 1);
        assert_eq!(config.pool.max_concurrency, 200);
        assert_eq!(config.pool.autoscale_interval, Duration::from_secs(10));
        assert_eq!(config.snapshotter.max_used_memory_ratio, 0.7);
        assert_eq!(config.queue.head_min_length, 100);

        let storage = storage_config_from_settings(&Settings::new()).unwrap();
        assert_eq!(storage.backend, StorageBackend::Memory);
        assert!(storage.purge_on_start);
    }

    #[test]
    fn test_settings_override_defaults() {
        let settings = Settings::from_toml(
            r#"
            MIN_CONCURRENCY = 2
            MAX_CONCURRENCY = 8
            MAX_TASKS_PER_MINUTE = 60
            AUTOSCALE_INTERVAL_MS = 2000
            DRAIN_TIMEOUT_MS = 5000
            MAX_USED_MEMORY_RATIO = 0.5
            MAX_CPU_OVERLOADED_RATIO = 0.3
            CONSISTENCY_DELAY_MS = 100
            STORAGE_DIR = "/tmp/autocrawl"
            PURGE_ON_START = false
        "#,
        )
        .unwrap();

        let config = crawler_config_from_settings(&settings).unwrap();
        assert_eq!(config.pool.min_concurrency, 2);
        assert_eq!(config.pool.max_concurrency, 8);
        assert_eq!(config.pool.max_tasks_per_minute, Some(60));
        assert_eq!(config.pool.autoscale_interval, Duration::from_secs(2));
        assert_eq!(config.pool.drain_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.snapshotter.max_used_memory_ratio, 0.5);
        assert_eq!(config.system_status.max_cpu_overloaded_ratio, 0.3);
        assert_eq!(config.queue.consistency_delay, Duration::from_millis(100));

        let storage = storage_config_from_settings(&settings).unwrap();
        assert_eq!(
            storage.backend,
            StorageBackend::File {
                root: PathBuf::from("/tmp/autocrawl")
            }
        );
        assert!(!storage.purge_on_start);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let settings = Settings::from_toml("MIN_CONCURRENCY = 10\nMAX_CONCURRENCY = 2").unwrap();
        assert!(matches!(
            crawler_config_from_settings(&settings),
            Err(SettingsError::Invalid(_))
        ));

        let settings = Settings::from_toml("MAX_USED_CPU_RATIO = 1.5").unwrap();
        assert!(crawler_config_from_settings(&settings).is_err());

        let settings = Settings::from_toml("MAX_CONCURRENCY = \"lots\"").unwrap();
        assert!(matches!(
            crawler_config_from_settings(&settings),
            Err(SettingsError::JsonParse(_))
        ));
    }

    #[tokio::test]
    async fn test_open_queue_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::new();
        settings.set("STORAGE_DIR", dir.path()).unwrap();
        settings.set("QUEUE_NAME", "products").unwrap();

        let context = StorageContext::new(storage_config_from_settings(&settings).unwrap());
        let queue = open_queue_from_settings(&context, &settings, None).await.unwrap();
        assert_eq!(queue.name(), "products");

        let other = open_queue_from_settings(&context, &settings, Some("reviews"))
            .await
            .unwrap();
        assert_eq!(other.name(), "reviews");
        assert_eq!(context.queue_names(), vec!["products", "reviews"]);

        settings.set("HEAD_MIN_LENGTH", 0).unwrap();
        assert!(matches!(
            open_queue_from_settings(&context, &settings, None).await,
            Err(SettingsError::Invalid(_))
        ));
    }
}
