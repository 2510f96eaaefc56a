//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with standardized naming conventions.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::{Duration, Instant};

/// Metrics prefix for all BlogForge metrics
pub const METRICS_PREFIX: &str = "blogforge";

/// Histogram buckets for request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001,  // 1ms
    0.005,  // 5ms
    0.010,  // 10ms
    0.025,  // 25ms
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
];

/// Buckets for stage and job durations; stages run external processes
pub const STAGE_BUCKETS: &[f64] = &[
    0.5,
    1.0,
    5.0,
    10.0,
    30.0,
    60.0,
    120.0,
    300.0,
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Article metrics
    describe_counter!(
        format!("{}_articles_created_total", METRICS_PREFIX),
        Unit::Count,
        "Total articles created"
    );

    describe_counter!(
        format!("{}_articles_published_total", METRICS_PREFIX),
        Unit::Count,
        "Total articles published"
    );

    // Pipeline metrics
    describe_histogram!(
        format!("{}_stage_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Generation stage latency in seconds"
    );

    describe_counter!(
        format!("{}_stage_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Generation stage failures by reason"
    );

    describe_counter!(
        format!("{}_generation_jobs_total", METRICS_PREFIX),
        Unit::Count,
        "Generation job attempts by outcome"
    );

    describe_histogram!(
        format!("{}_generation_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Full pipeline latency in seconds"
    );

    describe_counter!(
        format!("{}_generation_retries_total", METRICS_PREFIX),
        Unit::Count,
        "Generation jobs scheduled for another attempt"
    );

    // Queue metrics
    describe_counter!(
        format!("{}_queue_messages_processed_total", METRICS_PREFIX),
        Unit::Count,
        "Total queue messages processed"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

pub fn record_article_created() {
    counter!(format!("{}_articles_created_total", METRICS_PREFIX)).increment(1);
}

pub fn record_article_published() {
    counter!(format!("{}_articles_published_total", METRICS_PREFIX)).increment(1);
}

/// Record one stage invocation; `failure` carries the failure reason
pub fn record_stage(stage: &'static str, duration: Duration, failure: Option<&'static str>) {
    histogram!(
        format!("{}_stage_duration_seconds", METRICS_PREFIX),
        "stage" => stage
    )
    .record(duration.as_secs_f64());

    if let Some(reason) = failure {
        counter!(
            format!("{}_stage_failures_total", METRICS_PREFIX),
            "stage" => stage,
            "reason" => reason
        )
        .increment(1);
    }
}

/// Record the outcome of one job attempt: succeeded, retrying, failed or skipped
pub fn record_job_outcome(outcome: &'static str, duration: Option<Duration>) {
    counter!(
        format!("{}_generation_jobs_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);

    if let Some(duration) = duration {
        histogram!(
            format!("{}_generation_duration_seconds", METRICS_PREFIX),
            "outcome" => outcome
        )
        .record(duration.as_secs_f64());
    }

    counter!(format!("{}_queue_messages_processed_total", METRICS_PREFIX)).increment(1);
}

pub fn record_job_retry(attempt: u32) {
    counter!(
        format!("{}_generation_retries_total", METRICS_PREFIX),
        "attempt" => attempt.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_sorted() {
        for buckets in [LATENCY_BUCKETS, STAGE_BUCKETS] {
            let mut prev = 0.0;
            for &bucket in buckets {
                assert!(bucket > prev);
                prev = bucket;
            }
        }
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: every call is a no-op
        let metrics = RequestMetrics::start("POST", "/api/v1/articles");
        metrics.finish(202);
        record_stage("scrape", Duration::from_millis(10), Some("timeout"));
        record_job_outcome("failed", Some(Duration::from_secs(1)));
        record_job_retry(2);
    }
}
