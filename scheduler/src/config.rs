use std::time::Duration;

use autocrawl_core::error::{ConfigError, Result};

/// Configuration for request queues
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Minimum number of ids requested per head refresh
    pub head_min_length: usize,
    /// Head refreshes request this many ids per in-progress request
    pub head_buffer_factor: usize,
    /// Number of handled ids remembered to avoid refetching them
    pub recently_handled_capacity: usize,
    /// Number of known unique keys cached to skip storage on duplicate adds
    pub requests_cache_capacity: usize,
    /// How long after the last write a queue shared by several clients
    /// must stay quiet before it counts as finished
    pub consistency_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            head_min_length: 100,
            head_buffer_factor: 3,
            recently_handled_capacity: 1000,
            requests_cache_capacity: 100_000,
            consistency_delay: Duration::from_secs(3),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.head_min_length == 0 {
            return Err(ConfigError::new("head_min_length", "must be at least 1").into());
        }
        if self.head_buffer_factor == 0 {
            return Err(ConfigError::new("head_buffer_factor", "must be at least 1").into());
        }
        if self.recently_handled_capacity == 0 {
            return Err(
                ConfigError::new("recently_handled_capacity", "must be at least 1").into(),
            );
        }
        Ok(())
    }

    pub fn with_head_min_length(mut self, head_min_length: usize) -> Self {
        self.head_min_length = head_min_length;
        self
    }

    pub fn with_consistency_delay(mut self, delay: Duration) -> Self {
        self.consistency_delay = delay;
        self
    }

    pub fn with_requests_cache_capacity(mut self, capacity: usize) -> Self {
        self.requests_cache_capacity = capacity;
        self
    }
}
