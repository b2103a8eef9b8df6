//! Structured logging setup for Volary components.
//!
//! Console output is human-readable with local timestamps; the JSON variant
//! is meant for log shippers. The level argument acts as a default and can
//! always be overridden through `RUST_LOG`.

use anyhow::Result;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Build the environment filter from `RUST_LOG`, falling back to `level`.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize console logging with the given default level.
///
/// Levels: trace, debug, info, warn, error.
pub fn init_logging(level: &str) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    Ok(())
}

/// Initialize JSON logging for machine consumption.
pub fn init_logging_json(level: &str) -> Result<()> {
    let fmt_layer = fmt::layer().json().with_current_span(true);

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    Ok(())
}

/// Measures the duration of an operation and logs it on drop.
///
/// ```rust
/// use volary_common::TimedOperation;
///
/// {
///     let _op = TimedOperation::new("domain-connect");
///     // ... work ...
/// } // logs elapsed time here
/// ```
pub struct TimedOperation {
    name: &'static str,
    start: std::time::Instant,
}

impl TimedOperation {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for TimedOperation {
    fn drop(&mut self) {
        tracing::debug!(
            operation = self.name,
            elapsed_ms = self.start.elapsed().as_millis() as u64,
            "operation finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_falls_back_to_level() {
        let filter = env_filter("debug");
        assert!(!filter.to_string().is_empty());
    }

    #[test]
    fn timed_operation_does_not_panic() {
        let op = TimedOperation::new("noop");
        drop(op);
    }
}
