// Crawler statistics and state

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use autocrawl_core::error_handler::ErrorStats;

use crate::pool::PoolStats;

/// Statistics for the basic crawler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawlerStats {
    /// Requests the handler completed
    pub requests_finished: usize,

    /// Requests given up on after failing
    pub requests_failed: usize,

    /// Failed attempts sent back to the queue
    pub requests_retried: usize,

    /// Total handler time of finished requests in milliseconds
    pub finished_duration_millis: u64,

    /// Start time of the crawl
    pub started_at: Option<DateTime<Utc>>,

    /// End time of the crawl
    pub finished_at: Option<DateTime<Utc>>,
}

impl CrawlerStats {
    pub fn mark_started(&mut self) {
        self.started_at = Some(Utc::now());
        self.finished_at = None;
    }

    pub fn mark_finished(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn record_finished(&mut self, duration: Duration) {
        self.requests_finished += 1;
        self.finished_duration_millis += duration.as_millis() as u64;
    }

    pub fn record_failed(&mut self) {
        self.requests_failed += 1;
    }

    pub fn record_retry(&mut self) {
        self.requests_retried += 1;
    }

    /// Requests that reached a final state
    pub fn requests_handled(&self) -> usize {
        self.requests_finished + self.requests_failed
    }

    /// Calculate the duration of the crawl
    pub fn duration(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some((end - start).to_std().unwrap_or_default())
    }

    /// Calculate the handled requests per minute
    pub fn requests_per_minute(&self) -> Option<f64> {
        self.duration().map(|duration| {
            let minutes = duration.as_secs_f64() / 60.0;
            if minutes > 0.0 {
                self.requests_handled() as f64 / minutes
            } else {
                0.0
            }
        })
    }

    /// Average handler time of finished requests
    pub fn average_request_duration(&self) -> Option<Duration> {
        if self.requests_finished == 0 {
            return None;
        }
        Some(Duration::from_millis(
            self.finished_duration_millis / self.requests_finished as u64,
        ))
    }
}

/// Crawler state for serialization and persistence
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlerState {
    /// Crawler statistics
    pub stats: CrawlerStats,

    /// Error statistics
    pub errors: ErrorStats,

    /// Counters of the last pool run
    pub pool: Option<PoolStats>,
}
