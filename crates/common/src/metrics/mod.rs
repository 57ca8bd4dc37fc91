//! Metrics and observability utilities
//!
//! Provides Prometheus metrics for the recall engine with
//! standardized naming conventions.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

/// Metrics prefix for all Quill metrics
pub const METRICS_PREFIX: &str = "quill";

/// Histogram buckets for retrieval latency (in seconds)
pub const RETRIEVAL_BUCKETS: &[f64] = &[
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

/// Buckets for embedding latency (typically slower)
pub const EMBEDDING_BUCKETS: &[f64] = &[
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.000,  // 2s
    5.000,  // 5s
    10.00,  // 10s
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Total questions handled, by classified kind"
    );

    describe_histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Retrieval latency in seconds, by path"
    );

    describe_counter!(
        format!("{}_retrieval_fallbacks_total", METRICS_PREFIX),
        Unit::Count,
        "Recency fallbacks taken, by reason"
    );

    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API requests"
    );

    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );

    describe_counter!(
        format!("{}_completion_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total completion requests, by mode and status"
    );

    describe_counter!(
        format!("{}_stream_frames_total", METRICS_PREFIX),
        Unit::Count,
        "Frames emitted on outbound answer streams"
    );

    describe_counter!(
        format!("{}_streams_cancelled_total", METRICS_PREFIX),
        Unit::Count,
        "Answer streams dropped by the caller before completion"
    );

    describe_counter!(
        format!("{}_decode_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Malformed completion increments skipped"
    );

    tracing::info!("Metrics registered");
}

/// Record a classified question
pub fn record_query(kind: &str) {
    counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record the latency of one retrieval path
pub fn record_retrieval(duration_secs: f64, path: &str) {
    histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        "path" => path.to_string()
    )
    .record(duration_secs);
}

/// Record a recency fallback and why it happened
pub fn record_fallback(reason: &str) {
    counter!(
        format!("{}_retrieval_fallbacks_total", METRICS_PREFIX),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Helper to record embedding metrics
pub fn record_embedding(duration_secs: f64, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
    }
}

/// Record a completion request outcome
pub fn record_completion(mode: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_completion_requests_total", METRICS_PREFIX),
        "mode" => mode.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record one outbound frame
pub fn record_frame(kind: &str) {
    counter!(
        format!("{}_stream_frames_total", METRICS_PREFIX),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a stream dropped by its caller
pub fn record_stream_cancelled() {
    counter!(format!("{}_streams_cancelled_total", METRICS_PREFIX)).increment(1);
}

/// Record a skipped malformed increment
pub fn record_decode_error(format: &str) {
    counter!(
        format!("{}_decode_errors_total", METRICS_PREFIX),
        "format" => format.to_string()
    )
    .increment(1);
}
