use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus metrics exporter and register metric metadata.
pub fn init() -> Result<PrometheusHandle, Box<dyn std::error::Error>> {
    let builder = PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("llmux_request_duration_seconds".to_string()),
        &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 120.0],
    )?;

    let handle = builder.install_recorder()?;

    describe_counter!(
        "llmux_requests_total",
        "Chat requests received, labelled by dialect and outcome"
    );
    describe_histogram!(
        "llmux_request_duration_seconds",
        "End-to-end request duration in seconds"
    );
    describe_counter!(
        "llmux_upstream_errors_total",
        "Upstream failures, labelled by provider and HTTP status"
    );
    describe_counter!(
        "llmux_stream_events_total",
        "Stream events delivered to clients"
    );
    describe_counter!(
        "llmux_credential_cooldowns_total",
        "Credential suspensions recorded by the result worker"
    );

    Ok(handle)
}

pub fn record_request(dialect: &str, provider: &str, success: bool, latency: Duration) {
    let outcome = if success { "success" } else { "error" };
    counter!(
        "llmux_requests_total",
        "dialect" => dialect.to_string(),
        "provider" => provider.to_string(),
        "outcome" => outcome,
    )
    .increment(1);
    histogram!(
        "llmux_request_duration_seconds",
        "dialect" => dialect.to_string(),
    )
    .record(latency.as_secs_f64());
}

pub fn record_upstream_error(provider: &str, status: u16) {
    counter!(
        "llmux_upstream_errors_total",
        "provider" => provider.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
}

pub fn record_stream_events(dialect: &str, count: u64) {
    counter!(
        "llmux_stream_events_total",
        "dialect" => dialect.to_string(),
    )
    .increment(count);
}

pub fn record_cooldown(provider: &str, reason: &str) {
    counter!(
        "llmux_credential_cooldowns_total",
        "provider" => provider.to_string(),
        "reason" => reason.to_string(),
    )
    .increment(1);
}
