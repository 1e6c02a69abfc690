// Telemetry module for structured logging and cache refresh metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const UPDATE_RUNS_TOTAL: &str = "cache_update_runs_total";
pub const UPDATE_DURATION_SECONDS: &str = "cache_update_duration_seconds";
pub const CANDIDATE_FAILURES_TOTAL: &str = "cache_candidate_failures_total";
pub const STALE_LOCKS_RELEASED_TOTAL: &str = "cache_stale_locks_released_total";

/// Initialize structured logging
///
/// `RUST_LOG` takes precedence over `log_level` when set. With `json` the
/// output is one JSON object per event, including the current span;
/// otherwise a compact human-readable format is used.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let layer = if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_thread_names(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(log_level = log_level, json = json, "Structured logging initialized");

    Ok(())
}

/// Initialize the Prometheus metrics exporter on `0.0.0.0:<metrics_port>`
///
/// Must be called from within a tokio runtime. Without an exporter every
/// `record_*` call below is a no-op.
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(UPDATE_RUNS_TOTAL, "Update job firings by outcome");
    describe_histogram!(
        UPDATE_DURATION_SECONDS,
        "Wall-clock duration of update passes that held the lock"
    );
    describe_counter!(
        CANDIDATE_FAILURES_TOTAL,
        "Recoverable refresh failures per cache candidate"
    );
    describe_counter!(
        STALE_LOCKS_RELEASED_TOTAL,
        "Lock files released by the stale lock sweep"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_update_outcome(outcome: &'static str) {
    counter!(UPDATE_RUNS_TOTAL, "outcome" => outcome).increment(1);
}

#[inline]
pub fn record_update_duration(elapsed: Duration) {
    histogram!(UPDATE_DURATION_SECONDS).record(elapsed.as_secs_f64());
}

#[inline]
pub fn record_candidate_failure(candidate: &str) {
    counter!(CANDIDATE_FAILURES_TOTAL, "candidate" => candidate.to_string()).increment(1);
}

#[inline]
pub fn record_stale_lock_released() {
    counter!(STALE_LOCKS_RELEASED_TOTAL).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_logging_init_fails() {
        // Only one global subscriber can be installed per process
        let _ = init_logging("info", false);
        assert!(init_logging("debug", true).is_err());
    }

    #[test]
    fn test_metrics_recording_without_exporter() {
        record_update_outcome("completed");
        record_update_duration(Duration::from_millis(1500));
        record_candidate_failure("DirectoryIndexCache");
        record_stale_lock_released();
    }
}
