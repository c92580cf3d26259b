//! # autocrawl
//!
//! An autoscaling crawl runtime: a pool that runs as many concurrent tasks
//! as the machine can take, fed by a persistent, deduplicating request queue.
//!
//! ## Components
//!
//! - **Core**: requests, errors, retry policy and storage client load counters.
//! - **Storage**: queue storage backends (memory and JSON files) and the
//!   storage context that owns them.
//! - **Scheduler**: the request queue with its head cache and in-progress leases.
//! - **Engine**: the resource snapshotter, system status evaluator,
//!   autoscaled pool and the basic crawler that ties them together.
//! - **Settings**: file based configuration mapped onto the typed configs.
//!
//! ## Example
//!
//! ```rust,no_run
//! use autocrawl::prelude::*;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl RequestHandler for Printer {
//!     async fn handle_request(&self, context: &mut CrawlingContext) -> Result<()> {
//!         println!("{}", context.request.url);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     env_logger::init();
//!
//!     let context = StorageContext::in_memory();
//!     let crawler =
//!         BasicCrawler::open(&context, None, Arc::new(Printer), CrawlerConfig::default()).await?;
//!     crawler
//!         .add_requests(vec![Request::get("https://example.com")?])
//!         .await?;
//!
//!     let stats = crawler.run().await?;
//!     println!("Requests finished: {}", stats.requests_finished);
//!     Ok(())
//! }
//! ```

pub use autocrawl_core as core;
pub use autocrawl_engine as engine;
pub use autocrawl_scheduler as scheduler;
pub use autocrawl_storage as storage;

pub mod settings;

pub mod config_adapters;

/// Prelude module that re-exports commonly used types
pub mod prelude {
    pub use autocrawl_core::error::{Error, Result};
    pub use autocrawl_core::error_handler::{
        DefaultErrorHandler, ErrorAction, ErrorHandler, ErrorManager,
    };
    pub use autocrawl_core::request::{Method, Request};
    pub use autocrawl_core::{async_trait, ClientLoad};
    pub use autocrawl_engine::{
        AutoscaledPool, BasicCrawler, CrawlerConfig, CrawlerStats, CrawlingContext, Event,
        PoolConfig, PoolState, PoolStats, RequestHandler, Snapshotter, SnapshotterConfig,
        StatusSource, SystemStatus, SystemStatusConfig, TaskContext, TaskProvider,
    };
    pub use autocrawl_scheduler::{QueueConfig, RequestQueue};
    pub use autocrawl_storage::{StorageBackend, StorageConfig, StorageContext};

    pub use crate::settings::{Settings, SettingsError, SettingsFormat};
}
