use std::time::Instant;

use tracing::trace;

/// Reports how long a named task took, at `trace` level.
pub struct TaskTimer {
    start_time: Instant,
    task_name: &'static str,
}

impl TaskTimer {
    pub fn new(task_name: &'static str) -> Self {
        trace!(task = task_name, "task started");
        Self {
            start_time: Instant::now(),
            task_name,
        }
    }

    pub fn stop(&self) {
        trace!(
            task = self.task_name,
            elapsed_ms = format!("{:.1}", self.start_time.elapsed().as_secs_f64() * 1000.0),
            "task finished"
        );
    }
}
