use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tokio_test::assert_ok;

use autocrawl_core::error::Result;
use autocrawl_core::request::Request;
use autocrawl_engine::{
    BasicCrawler, CrawlerConfig, CrawlingContext, PoolConfig, RequestHandler, StatusSource,
    SystemInfo,
};
use autocrawl_scheduler::{QueueConfig, RequestQueue};
use autocrawl_storage::{FileStorage, MemoryStorage};

/// Reports overload until a deadline, idle afterwards
struct OverloadedUntil(Option<Instant>);

impl OverloadedUntil {
    fn info(&self) -> SystemInfo {
        match self.0 {
            Some(until) if Instant::now() < until => SystemInfo {
                is_system_idle: false,
                ..SystemInfo::default()
            },
            _ => SystemInfo::idle(),
        }
    }
}

#[async_trait]
impl StatusSource for OverloadedUntil {
    async fn current_status(&self) -> SystemInfo {
        self.info()
    }

    async fn historical_status(&self) -> SystemInfo {
        self.info()
    }
}

/// Records the order of handled URLs and how many handlers run at once
struct RecordingHandler {
    started_at: Instant,
    work: Duration,
    order: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    timeline: Mutex<Vec<(Duration, usize)>>,
}

impl RecordingHandler {
    fn new(work: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            work,
            order: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            timeline: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RequestHandler for RecordingHandler {
    async fn handle_request(&self, context: &mut CrawlingContext) -> Result<()> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.timeline
            .lock()
            .unwrap()
            .push((self.started_at.elapsed(), running));

        sleep(self.work).await;

        self.order
            .lock()
            .unwrap()
            .push(context.request.url.path().to_string());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pages(count: usize) -> Vec<Request> {
    (1..=count)
        .map(|i| Request::get(format!("https://example.com/page/{}", i)).unwrap())
        .collect()
}

fn config(min: usize, max: usize) -> CrawlerConfig {
    CrawlerConfig {
        pool: PoolConfig {
            maybe_run_interval: Duration::from_millis(100),
            autoscale_interval: Duration::from_millis(500),
            ..PoolConfig::default().with_concurrency(min, max)
        },
        ..CrawlerConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_sequential_crawl_handles_requests_in_insertion_order() {
    init_logger();
    let queue = Arc::new(
        RequestQueue::new(Arc::new(MemoryStorage::new("ordered")), QueueConfig::default())
            .unwrap(),
    );
    let handler = Arc::new(RecordingHandler::new(Duration::from_millis(200)));
    let crawler = BasicCrawler::new(queue.clone(), handler.clone(), config(1, 1))
        .unwrap()
        .with_status_source(Arc::new(OverloadedUntil(None)));
    crawler.add_requests(pages(6)).await.unwrap();

    let stats = crawler.run().await.unwrap();

    let expected: Vec<String> = (1..=6).map(|i| format!("/page/{}", i)).collect();
    assert_eq!(*handler.order.lock().unwrap(), expected);
    assert_eq!(stats.requests_finished, 6);
    assert!(handler
        .timeline
        .lock()
        .unwrap()
        .iter()
        .all(|(_, running)| *running == 1));

    assert_eq!(queue.handled_count().await.unwrap(), 6);
    assert_eq!(queue.pending_count().await.unwrap(), 0);
    assert!(queue.is_finished().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_grows_only_after_overload_clears() {
    init_logger();
    let queue = Arc::new(
        RequestQueue::new(Arc::new(MemoryStorage::new("overload")), QueueConfig::default())
            .unwrap(),
    );
    let handler = Arc::new(RecordingHandler::new(Duration::from_secs(1)));
    let status = OverloadedUntil(Some(Instant::now() + Duration::from_secs(2)));
    let crawler = BasicCrawler::new(queue.clone(), handler.clone(), config(1, 3))
        .unwrap()
        .with_status_source(Arc::new(status));
    crawler.add_requests(pages(6)).await.unwrap();

    let stats = crawler.run().await.unwrap();
    assert_eq!(stats.requests_finished, 6);

    let timeline = handler.timeline.lock().unwrap().clone();
    let window = Duration::from_secs(2);
    assert!(timeline
        .iter()
        .filter(|(at, _)| *at < window)
        .all(|(_, running)| *running == 1));
    assert!(timeline
        .iter()
        .any(|(at, running)| *at >= window && *running > 1));

    let pool = crawler.pool_stats().await.unwrap();
    assert!(pool.scale_ups >= 1);
    assert!(pool.peak_concurrency > 1);
    assert!(queue.is_finished().await.unwrap());
}

#[tokio::test]
async fn test_crawl_resumes_from_file_storage() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();

    {
        let storage = Arc::new(FileStorage::open(dir.path(), "resume").await.unwrap());
        let queue = Arc::new(RequestQueue::new(storage, QueueConfig::default()).unwrap());
        queue.add_requests(pages(5), false).await.unwrap();
        let handler = Arc::new(RecordingHandler::new(Duration::from_millis(10)));
        let crawler = BasicCrawler::new(
            queue,
            handler,
            CrawlerConfig {
                max_requests_per_crawl: Some(2),
                ..config(1, 1)
            },
        )
        .unwrap()
        .with_status_source(Arc::new(OverloadedUntil(None)));
        assert_eq!(crawler.run().await.unwrap().requests_finished, 2);
    }

    let storage = Arc::new(FileStorage::open(dir.path(), "resume").await.unwrap());
    let queue = Arc::new(RequestQueue::new(storage, QueueConfig::default()).unwrap());
    let handler = Arc::new(RecordingHandler::new(Duration::from_millis(10)));
    let crawler = BasicCrawler::new(queue.clone(), handler.clone(), config(1, 1))
        .unwrap()
        .with_status_source(Arc::new(OverloadedUntil(None)));

    assert_ok!(crawler.run().await);
    assert_eq!(
        *handler.order.lock().unwrap(),
        vec!["/page/3", "/page/4", "/page/5"]
    );

    // nothing is left for a second run
    let stats = assert_ok!(crawler.run().await);
    assert_eq!(stats.requests_finished, 3);
    assert_eq!(handler.order.lock().unwrap().len(), 3);
    assert_eq!(queue.handled_count().await.unwrap(), 5);
}
