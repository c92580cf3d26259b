use std::collections::VecDeque;

use autocrawl_storage::QueueTotals;
use chrono::{DateTime, Utc};

/// Local read-ahead of the next eligible request ids
#[derive(Debug, Default)]
pub(crate) struct QueueHeadCache {
    ids: VecDeque<String>,
    /// Queue modification time seen by the last refresh
    modified_at: Option<DateTime<Utc>>,
    /// The last refresh returned every pending request
    complete: bool,
    force_refresh: bool,
    had_multiple_clients: bool,
}

impl QueueHeadCache {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn had_multiple_clients(&self) -> bool {
        self.had_multiple_clients
    }

    /// Needs a refresh regardless of what storage says
    pub fn must_refresh(&self) -> bool {
        self.ids.is_empty() || self.force_refresh
    }

    /// Another client wrote to the queue after the last refresh.
    ///
    /// Own writes are mirrored into the head as they happen, so only foreign
    /// writes count, however many own writes followed them.
    pub fn is_stale(&self, totals: &QueueTotals) -> bool {
        match (self.modified_at, totals.foreign_modified_at) {
            (None, _) => true,
            (Some(seen), Some(foreign)) => foreign > seen,
            (Some(_), None) => false,
        }
    }

    pub fn replace(
        &mut self,
        ids: Vec<String>,
        modified_at: Option<DateTime<Utc>>,
        complete: bool,
        had_multiple_clients: bool,
    ) {
        self.ids = ids.into();
        self.modified_at = modified_at;
        self.complete = complete;
        self.force_refresh = false;
        self.had_multiple_clients = had_multiple_clients;
    }

    pub fn contains_any(&self, mut eligible: impl FnMut(&str) -> bool) -> bool {
        self.ids.iter().any(|id| eligible(id))
    }

    pub fn pop_front(&mut self) -> Option<String> {
        self.ids.pop_front()
    }

    pub fn push_front(&mut self, id: String) {
        self.remove(&id);
        self.ids.push_front(id);
    }

    /// Append an id; only valid when the head holds the whole queue
    pub fn push_back(&mut self, id: String) {
        if self.complete {
            self.remove(&id);
            self.ids.push_back(id);
        }
    }

    pub fn remove(&mut self, id: &str) {
        self.ids.retain(|x| x != id);
    }

    pub fn invalidate(&mut self) {
        self.force_refresh = true;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
