use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use tokio::runtime::Runtime;

use autocrawl::config_adapters::*;
use autocrawl::core::Request;
use autocrawl::engine::utils::format_duration;
use autocrawl::engine::{
    BasicCrawler, CrawlingContext, RequestHandler, ResourceKind, Snapshotter, StatusSource,
    SystemInfo, SystemStatus,
};
use autocrawl::settings::{Result, Settings};
use autocrawl::storage::{StorageBackend, StorageContext};

#[derive(Parser)]
#[command(
    name = "autocrawl",
    about = "An autoscaling crawl runtime with a persistent request queue",
    version,
    long_about = None
)]
struct Cli {
    /// Settings file to use (.toml or .json)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Directory of the file storage; overrides STORAGE_DIR
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage request queues
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Sample the system and print its status
    #[command(name = "status")]
    Status {
        /// How long to sample before printing
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },

    /// Process every request in a queue
    #[command(name = "run")]
    Run {
        /// Queue to process (defaults to QUEUE_NAME, then the default queue)
        #[arg(short, long)]
        queue: Option<String>,

        /// Crawler state file, loaded before and saved after the run
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Add URLs to a queue
    #[command(name = "add")]
    Add {
        /// URLs to enqueue
        #[arg(required = true)]
        urls: Vec<String>,

        /// Queue name
        #[arg(short, long)]
        queue: Option<String>,

        /// Put the requests at the head of the queue
        #[arg(long)]
        forefront: bool,
    },

    /// Show queue counters
    #[command(name = "info")]
    Info {
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Delete a queue and all its requests
    #[command(name = "purge")]
    Purge {
        #[arg(short, long)]
        queue: Option<String>,
    },
}

/// Handler that only logs what it is given
struct LogHandler;

#[async_trait]
impl RequestHandler for LogHandler {
    async fn handle_request(&self, context: &mut CrawlingContext) -> autocrawl::core::Result<()> {
        info!(
            "Handled {} {} (retries: {})",
            context.request.method, context.request.url, context.request.retry_count
        );
        Ok(())
    }

    async fn handle_failed_request(
        &self,
        context: &CrawlingContext,
        error: &autocrawl::core::Error,
    ) -> autocrawl::core::Result<()> {
        warn!("Gave up on {}: {}", context.request.url, error);
        Ok(())
    }
}

fn main() {
    let cli = Cli::parse();

    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let runtime = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error creating runtime: {}", e);
            process::exit(1);
        }
    };

    let settings = load_settings(cli.settings.as_deref());
    let result = runtime.block_on(dispatch(cli.command, cli.storage_dir, settings));

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn dispatch(
    command: Commands,
    storage_dir: Option<PathBuf>,
    settings: Settings,
) -> Result<()> {
    match command {
        Commands::Queue(command) => {
            let context = storage_context(&settings, storage_dir)?;
            queue_command(&context, &settings, command).await
        }
        Commands::Status { seconds } => show_status(&settings, seconds).await,
        Commands::Run { queue, state } => {
            let context = storage_context(&settings, storage_dir)?;
            run_queue(&context, &settings, queue.as_deref(), state.as_deref()).await
        }
    }
}

async fn queue_command(
    context: &StorageContext,
    settings: &Settings,
    command: QueueCommands,
) -> Result<()> {
    match command {
        QueueCommands::Add {
            urls,
            queue,
            forefront,
        } => {
            let queue = open_queue_from_settings(context, settings, queue.as_deref()).await?;
            let requests = urls
                .iter()
                .map(Request::get)
                .collect::<autocrawl::core::Result<Vec<_>>>()?;
            let infos = queue.add_requests(requests, forefront).await?;
            let added = infos.iter().filter(|i| !i.was_already_present).count();
            println!(
                "Added {} of {} requests to queue '{}'",
                added,
                infos.len(),
                queue.name()
            );
        }
        QueueCommands::Info { queue } => {
            let queue = open_queue_from_settings(context, settings, queue.as_deref()).await?;
            let info = queue.get_info().await?;
            println!("Queue: {} ({})", info.name, info.id);
            println!("Total requests: {}", info.total_request_count);
            println!("Handled requests: {}", info.handled_request_count);
            println!("Pending requests: {}", info.pending_request_count);
            println!("Created at: {}", info.created_at);
            println!("Modified at: {}", info.modified_at);
            println!("Accessed at: {}", info.accessed_at);
            println!("Had multiple clients: {}", info.had_multiple_clients);
        }
        QueueCommands::Purge { queue } => {
            let queue = open_queue_from_settings(context, settings, queue.as_deref()).await?;
            let name = queue.name().to_string();
            queue.drop_queue().await?;
            println!("Dropped queue '{}'", name);
        }
    }
    Ok(())
}

async fn show_status(settings: &Settings, seconds: u64) -> Result<()> {
    let config = crawler_config_from_settings(settings)?;
    let snapshotter = Arc::new(Snapshotter::new(config.snapshotter)?);
    let status = SystemStatus::new(snapshotter.clone(), config.system_status);

    println!("Sampling for {} seconds...", seconds);
    snapshotter.start().await;
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    snapshotter.stop().await;

    print_system_info("Current", &status.current_status().await);
    print_system_info("Historical", &status.historical_status().await);
    Ok(())
}

fn print_system_info(label: &str, info: &SystemInfo) {
    println!(
        "\n{} status: {}",
        label,
        if info.is_system_idle { "idle" } else { "overloaded" }
    );
    for kind in ResourceKind::ALL {
        let load = info.load(kind);
        println!(
            "  {:<10} overloaded: {:<5} ratio: {:.2} / {:.2} ({} samples)",
            kind.to_string(),
            load.is_overloaded,
            load.actual_ratio,
            load.limit_ratio,
            load.sample_count
        );
    }
}

async fn run_queue(
    context: &StorageContext,
    settings: &Settings,
    queue: Option<&str>,
    state: Option<&Path>,
) -> Result<()> {
    let config = crawler_config_from_settings(settings)?;
    let name = queue_name_from_settings(settings, queue)?;
    let crawler = BasicCrawler::open(context, name.as_deref(), Arc::new(LogHandler), config).await?;

    if let Some(path) = state.filter(|path| path.exists()) {
        crawler.load_state(path).await?;
        info!("Loaded crawler state from {}", path.display());
    }

    let result = crawler.run().await;

    if let Some(path) = state {
        crawler.save_state(path).await?;
    }

    let stats = result?;
    println!("\nCrawl completed!");
    println!("Requests finished: {}", stats.requests_finished);
    println!("Requests failed: {}", stats.requests_failed);
    println!("Requests retried: {}", stats.requests_retried);
    if let Some(duration) = stats.duration() {
        println!("Duration: {}", format_duration(duration));
    }
    if let Some(rpm) = stats.requests_per_minute() {
        println!("Requests per minute: {:.2}", rpm);
    }
    Ok(())
}

fn storage_context(settings: &Settings, storage_dir: Option<PathBuf>) -> Result<StorageContext> {
    let mut config = storage_config_from_settings(settings)?;
    if let Some(root) = storage_dir {
        config.backend = StorageBackend::File { root };
    } else if config.backend == StorageBackend::Memory {
        config.backend = StorageBackend::File {
            root: PathBuf::from("./storage"),
        };
    }
    // queues outlive a single invocation
    if !settings.contains("PURGE_ON_START") {
        config.purge_on_start = false;
    }
    Ok(StorageContext::new(config))
}

fn load_settings(settings_path: Option<&Path>) -> Settings {
    let Some(path) = settings_path else {
        return Settings::default();
    };

    match Settings::from_file(path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading settings from {}: {}", path.display(), e);
            eprintln!("Using default settings");
            Settings::default()
        }
    }
}
