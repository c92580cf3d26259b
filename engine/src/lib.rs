//! Autoscaled pool, resource snapshots and crawler composition.
//!
//! The [`Snapshotter`] samples memory, event loop lag, CPU and storage client
//! load. [`SystemStatus`] turns those samples into overload verdicts, which the
//! [`AutoscaledPool`] uses to scale the number of concurrently running tasks.
//! [`BasicCrawler`] wires a [`RequestQueue`](autocrawl_scheduler::RequestQueue)
//! into a pool.

pub mod config;
pub mod crawler;
pub mod events;
pub mod pool;
pub mod probes;
pub mod snapshotter;
pub mod stats;
pub mod system_status;
mod throughput;
pub mod utils;

// Re-export key types
pub use config::{CrawlerConfig, PoolConfig, SnapshotterConfig, SystemStatusConfig};
pub use crawler::{BasicCrawler, CrawlingContext, RequestHandler};
pub use events::{event_channel, Event, EventSender};
pub use pool::{AutoscaledPool, PoolState, PoolStats, TaskContext, TaskProvider};
pub use probes::{CpuProbe, MemoryProbe, MemoryUsage, SysinfoProbe};
pub use snapshotter::{ResourceKind, Snapshot, Snapshotter};
pub use stats::{CrawlerState, CrawlerStats};
pub use system_status::{ResourceLoad, StatusSource, SystemInfo, SystemStatus};


#[cfg(test)]
mod mock;
