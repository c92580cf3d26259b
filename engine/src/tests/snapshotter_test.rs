use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use autocrawl_core::client_load::ClientLoad;

use crate::mock::FixedProbe;
use crate::{
    ResourceKind, SnapshotterConfig, Snapshotter, StatusSource, SystemStatus, SystemStatusConfig,
};

fn snapshotter(probe: FixedProbe, config: SnapshotterConfig) -> Snapshotter {
    let probe = Arc::new(probe);
    Snapshotter::new(config)
        .unwrap()
        .with_probes(probe.clone(), probe)
}

fn limited_config() -> SnapshotterConfig {
    SnapshotterConfig {
        memory_limit_bytes: Some(1000),
        ..SnapshotterConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent_and_stop_waits() {
    let snapshotter = snapshotter(FixedProbe::new(100, 0.1), limited_config());

    snapshotter.start().await;
    snapshotter.start().await;
    assert!(snapshotter.is_running().await);

    sleep(Duration::from_millis(2500)).await;
    snapshotter.stop().await;
    assert!(!snapshotter.is_running().await);

    // one sampler, not two
    let samples = snapshotter.get_sample(ResourceKind::Cpu, None).await;
    assert_eq!(samples.len(), 3);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(snapshotter.get_sample(ResourceKind::Cpu, None).await.len(), 3);

    // stopping twice is harmless
    snapshotter.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_samples_are_judged_against_limits() {
    let snapshotter = snapshotter(FixedProbe::new(800, 0.5), limited_config());
    snapshotter.start().await;
    sleep(Duration::from_millis(3500)).await;
    snapshotter.stop().await;

    let memory = snapshotter.get_sample(ResourceKind::Memory, None).await;
    assert!(memory.len() >= 3);
    assert!(memory.iter().all(|s| s.is_overloaded));
    assert!((memory[0].raw_value - 0.8).abs() < 1e-9);

    let cpu = snapshotter.get_sample(ResourceKind::Cpu, None).await;
    assert!(cpu.iter().all(|s| !s.is_overloaded));

    // no real lag while time is paused
    let event_loop = snapshotter.get_sample(ResourceKind::EventLoop, None).await;
    assert!(event_loop.len() >= 6);
    assert!(event_loop.iter().all(|s| !s.is_overloaded));
}

#[tokio::test(start_paused = true)]
async fn test_memory_limit_defaults_to_quarter_of_total() {
    // total is eight times the used memory, so usage is half the limit
    let snapshotter = snapshotter(FixedProbe::new(1000, 0.1), SnapshotterConfig::default());
    snapshotter.start().await;
    sleep(Duration::from_millis(100)).await;
    snapshotter.stop().await;

    let memory = snapshotter.get_sample(ResourceKind::Memory, Some(1)).await;
    assert!((memory[0].raw_value - 0.5).abs() < 1e-9);
    assert!(!memory[0].is_overloaded);
}

#[tokio::test(start_paused = true)]
async fn test_history_is_evicted() {
    let config = SnapshotterConfig {
        snapshot_history: Duration::from_secs(5),
        ..limited_config()
    };
    let snapshotter = snapshotter(FixedProbe::new(100, 0.1), config);
    snapshotter.start().await;
    sleep(Duration::from_millis(20500)).await;

    let cpu = snapshotter.get_sample(ResourceKind::Cpu, None).await;
    assert_eq!(cpu.len(), 6);
    let newest = cpu[cpu.len() - 1].created_at;
    assert!(cpu
        .iter()
        .all(|s| newest.duration_since(s.created_at) <= Duration::from_secs(5)));
    assert!(cpu.windows(2).all(|w| w[0].created_at <= w[1].created_at));

    let recent = snapshotter
        .get_sample_since(ResourceKind::Cpu, Duration::from_secs(2))
        .await;
    assert!(recent
        .iter()
        .all(|s| Instant::now().duration_since(s.created_at) <= Duration::from_secs(2)));
    assert_eq!(recent.len(), 2);

    snapshotter.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_probe_only_skips_its_resource() {
    let snapshotter = snapshotter(FixedProbe::failing(), limited_config());
    snapshotter.start().await;
    sleep(Duration::from_millis(2500)).await;
    snapshotter.stop().await;

    assert!(snapshotter.get_sample(ResourceKind::Memory, None).await.is_empty());
    assert!(snapshotter.get_sample(ResourceKind::Cpu, None).await.is_empty());
    assert_eq!(snapshotter.get_sample(ResourceKind::Client, None).await.len(), 3);
    assert!(!snapshotter.get_sample(ResourceKind::EventLoop, None).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_client_errors_overload_the_client() {
    let load = Arc::new(ClientLoad::new());
    let snapshotter =
        snapshotter(FixedProbe::new(100, 0.1), limited_config()).with_client_load(load.clone());
    snapshotter.start().await;
    sleep(Duration::from_millis(10)).await;

    for _ in 0..5 {
        load.record_success();
        load.record_error();
    }
    sleep(Duration::from_secs(1)).await;

    let client = snapshotter.get_sample(ResourceKind::Client, None).await;
    assert_eq!(client.len(), 2);
    assert!(!client[0].is_overloaded);
    assert!(client[1].is_overloaded);
    assert!((client[1].raw_value - 0.5).abs() < 1e-9);

    // only the delta since the previous sample counts
    load.record_success();
    sleep(Duration::from_secs(1)).await;
    let latest = snapshotter.get_sample(ResourceKind::Client, Some(1)).await;
    assert!(!latest[0].is_overloaded);

    snapshotter.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_get_sample_returns_most_recent() {
    let snapshotter = snapshotter(FixedProbe::new(100, 0.1), limited_config());
    for value in 0..5 {
        snapshotter
            .record(ResourceKind::Memory, false, value as f64)
            .await;
    }

    let recent = snapshotter.get_sample(ResourceKind::Memory, Some(2)).await;
    let values: Vec<f64> = recent.iter().map(|s| s.raw_value).collect();
    assert_eq!(values, vec![3.0, 4.0]);
    assert_eq!(snapshotter.get_sample(ResourceKind::Memory, Some(10)).await.len(), 5);
    assert!(snapshotter.get_sample(ResourceKind::Cpu, None).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_system_status_current_and_historical() {
    let snapshotter = Arc::new(snapshotter(FixedProbe::new(100, 0.1), limited_config()));
    let status = SystemStatus::new(snapshotter.clone(), SystemStatusConfig::default());

    // nothing sampled yet counts as idle
    assert!(status.current_status().await.is_system_idle);

    for _ in 0..5 {
        snapshotter.record(ResourceKind::Cpu, true, 1.0).await;
    }
    sleep(Duration::from_secs(10)).await;
    for _ in 0..5 {
        snapshotter.record(ResourceKind::Cpu, false, 0.1).await;
        snapshotter.record(ResourceKind::Memory, false, 0.1).await;
    }

    let current = status.current_status().await;
    assert!(current.is_system_idle);
    assert_eq!(current.cpu_info.sample_count, 5);

    let historical = status.historical_status().await;
    assert!(!historical.is_system_idle);
    assert!(historical.cpu_info.is_overloaded);
    assert!((historical.cpu_info.actual_ratio - 0.5).abs() < 1e-9);
    assert_eq!(historical.overloaded(), vec![ResourceKind::Cpu]);
    assert!(!historical.memory_info.is_overloaded);
}
