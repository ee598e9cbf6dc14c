// Prometheus metrics definitions for the volleyball backend.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Scoring events waiting in the queue.
    pub static ref SCORING_QUEUE_DEPTH: IntGauge =
        IntGauge::new("volley_scoring_queue_depth", "Scoring events waiting to be applied").unwrap();

    /// Live WebSocket connections.
    pub static ref CONNECTED_WEBSOCKETS: IntGauge =
        IntGauge::new("volley_connected_websockets", "Live WebSocket connections").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Scoring events applied, by event type.
    pub static ref SCORING_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("volley_scoring_events_total", "Scoring events applied"),
        &["event_type"],
    )
    .unwrap();

    /// Scoring events that failed to apply, by event type.
    pub static ref SCORING_EVENTS_REJECTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("volley_scoring_events_rejected_total", "Scoring events rejected"),
        &["event_type"],
    )
    .unwrap();

    /// Rounds finalized.
    pub static ref ROUNDS_FINALIZED_TOTAL: IntCounter = IntCounter::new(
        "volley_rounds_finalized_total",
        "Rounds finalized",
    )
    .unwrap();

    /// Rounds created (opening rounds and progressions).
    pub static ref ROUNDS_CREATED_TOTAL: IntCounter = IntCounter::new(
        "volley_rounds_created_total",
        "Tournament rounds created",
    )
    .unwrap();

    /// Matches generated, by generation strategy.
    pub static ref MATCHES_GENERATED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("volley_matches_generated_total", "Matches generated"),
        &["strategy"],
    )
    .unwrap();

    /// Notifications published to the sink.
    pub static ref NOTIFICATIONS_PUBLISHED_TOTAL: IntCounter = IntCounter::new(
        "volley_notifications_published_total",
        "Notifications published",
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Time spent applying one scoring event, by event type.
    pub static ref SCORING_APPLY_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "volley_scoring_apply_duration_seconds",
            "Time to apply one scoring event",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["event_type"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(SCORING_QUEUE_DEPTH.clone()),
        Box::new(CONNECTED_WEBSOCKETS.clone()),
        Box::new(SCORING_EVENTS_TOTAL.clone()),
        Box::new(SCORING_EVENTS_REJECTED_TOTAL.clone()),
        Box::new(ROUNDS_FINALIZED_TOTAL.clone()),
        Box::new(ROUNDS_CREATED_TOTAL.clone()),
        Box::new(MATCHES_GENERATED_TOTAL.clone()),
        Box::new(NOTIFICATIONS_PUBLISHED_TOTAL.clone()),
        Box::new(SCORING_APPLY_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        REGISTRY.register(c).expect("failed to register metric");
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_metrics_returns_string() {
        register_metrics();
        let output = gather_metrics();
        assert!(output.is_empty() || output.contains("volley_"));
    }

    #[test]
    fn test_metric_increments() {
        SCORING_QUEUE_DEPTH.set(3);
        assert_eq!(SCORING_QUEUE_DEPTH.get(), 3);
        SCORING_QUEUE_DEPTH.set(0);

        SCORING_EVENTS_TOTAL.with_label_values(&["score_change"]).inc();
        SCORING_EVENTS_REJECTED_TOTAL.with_label_values(&["match_finish"]).inc();
        ROUNDS_FINALIZED_TOTAL.inc();
        ROUNDS_CREATED_TOTAL.inc();
        MATCHES_GENERATED_TOTAL.with_label_values(&["round_robin"]).inc();
        NOTIFICATIONS_PUBLISHED_TOTAL.inc();
        SCORING_APPLY_DURATION_SECONDS
            .with_label_values(&["score_change"])
            .observe(0.01);
    }
}
