// Utility functions for the engine

use std::time::Duration;

/// Format a duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}h {}m {}s", hours, minutes, seconds)
}

/// Concurrency change for one autoscale step, at least 1
pub fn scale_step(desired: usize, ratio: f64) -> usize {
    ((desired as f64 * ratio).ceil() as usize).max(1)
}
