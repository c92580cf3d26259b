use std::fmt;

use log::trace;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::pool::{PoolState, PoolStats};

/// Lifecycle events emitted by the pool and the crawler
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PoolStarted,
    StateChanged { from: PoolState, to: PoolState },
    ConcurrencyChanged { previous: usize, desired: usize },
    TaskStarted { slot_id: u64 },
    TaskFailed { slot_id: u64, message: String },
    TaskAborted { slot_id: u64 },
    PoolStopped(PoolStats),
    RequestHandled { request_id: String },
    RequestRetried { request_id: String, retry_count: u32 },
    RequestFailed { request_id: String, message: String },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::PoolStarted => write!(f, "pool_started"),
            Event::StateChanged { .. } => write!(f, "state_changed"),
            Event::ConcurrencyChanged { .. } => write!(f, "concurrency_changed"),
            Event::TaskStarted { .. } => write!(f, "task_started"),
            Event::TaskFailed { .. } => write!(f, "task_failed"),
            Event::TaskAborted { .. } => write!(f, "task_aborted"),
            Event::PoolStopped(_) => write!(f, "pool_stopped"),
            Event::RequestHandled { .. } => write!(f, "request_handled"),
            Event::RequestRetried { .. } => write!(f, "request_retried"),
            Event::RequestFailed { .. } => write!(f, "request_failed"),
        }
    }
}

/// Sending half of an event channel. Sends never block and are dropped
/// once the receiver is gone.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: UnboundedSender<Event>,
}

impl EventSender {
    pub fn send(&self, event: Event) {
        trace!("Emitting {}", event);
        let _ = self.sender.send(event);
    }
}

/// Create a new event channel
pub fn event_channel() -> (EventSender, UnboundedReceiver<Event>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (EventSender { sender }, receiver)
}
