use std::time::{Duration, Instant};

use serde_json::json;

use crate::logging::{LogLevel, Logger};

/// Logs the elapsed time of `task` at debug level when dropped.
pub struct ScopedExecutionTimer<'a> {
    task: &'a str,
    context: Option<&'a str>,
    started_at: Instant,
    logger: &'a Logger,
}

impl<'a> ScopedExecutionTimer<'a> {
    pub fn new(task: &'a str, context: Option<&'a str>, logger: &'a Logger) -> Self {
        Self {
            task,
            context,
            started_at: Instant::now(),
            logger,
        }
    }
}

impl Drop for ScopedExecutionTimer<'_> {
    fn drop(&mut self) {
        if !self.logger.enabled(LogLevel::Debug) {
            return;
        }

        let elapsed = self.started_at.elapsed();
        self.logger.log(
            LogLevel::Debug,
            self.context,
            "Task finished",
            Some(json!({
                "task": self.task,
                "elapsed_ms": elapsed.as_millis() as u64,
                "elapsed": render_elapsed(elapsed)
            })),
        );
    }
}

pub fn measure_execution<T>(
    task: &str,
    context: Option<&str>,
    logger: &Logger,
    run: impl FnOnce() -> T,
) -> T {
    let _timer = ScopedExecutionTimer::new(task, context, logger);
    run()
}

/// `850ms`, `12.40s` or `3m 05.2s`.
fn render_elapsed(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    if millis < 1_000 {
        return format!("{millis}ms");
    }

    let seconds = elapsed.as_secs_f64();
    if seconds < 60.0 {
        return format!("{seconds:.2}s");
    }

    let minutes = elapsed.as_secs() / 60;
    let remainder = seconds - (minutes * 60) as f64;
    format!("{minutes}m {remainder:04.1}s")
}
