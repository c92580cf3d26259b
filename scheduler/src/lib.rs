//! The request queue drained by the autoscaled pool.

mod config;
mod head;
mod queue;
mod recent;

pub use config::QueueConfig;
pub use queue::{FinishedCheck, QueueOperationInfo, RequestQueue};
