use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters of remote storage API calls and the calls that were rate limited
/// or failed. Shared between the storage client and the snapshotter.
#[derive(Debug, Default)]
pub struct ClientLoad {
    operations: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`ClientLoad`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientLoadCounters {
    /// Calls made since start
    pub operations: u64,
    /// Calls that failed or were rate limited
    pub errors: u64,
}

impl ClientLoadCounters {
    /// Counters accumulated since `earlier`
    pub fn delta_since(&self, earlier: &ClientLoadCounters) -> ClientLoadCounters {
        ClientLoadCounters {
            operations: self.operations.saturating_sub(earlier.operations),
            errors: self.errors.saturating_sub(earlier.errors),
        }
    }

    /// Fraction of calls that failed, zero when there were no calls
    pub fn error_ratio(&self) -> f64 {
        if self.operations == 0 {
            0.0
        } else {
            self.errors as f64 / self.operations as f64
        }
    }
}

impl ClientLoad {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a successful call
    pub fn record_success(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed or rate limited call
    pub fn record_error(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> ClientLoadCounters {
        ClientLoadCounters {
            operations: self.operations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
