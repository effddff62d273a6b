use std::sync::LazyLock;

use prometheus::*;

static METRIC_SEARCH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!("fs_search_duration", "duration of the per-image search in seconds")
        .unwrap()
});

static METRIC_SEARCH_MAX_SCORE: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "fs_search_max_score",
        "max similarity score of the per-image search",
        (1..=20).map(|x| x as f64 * 0.05).collect()
    )
    .unwrap()
});

static METRIC_INGEST_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("fs_ingest_count", "ingest outcomes by stage", &["outcome"])
        .unwrap()
});

static METRIC_GUARD_REJECTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("fs_guard_rejected", "requests rejected by abuse guard", &["tier"])
        .unwrap()
});

static METRIC_GUARD_FAIL_OPEN: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "fs_guard_fail_open",
        "requests allowed because the counter store was unreachable"
    )
    .unwrap()
});

static METRIC_PROXY_TRANSITION: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("fs_proxy_transition", "proxy health state transitions", &["state"])
        .unwrap()
});

pub fn inc_search_duration(duration: f32) {
    METRIC_SEARCH_DURATION.observe(duration as f64);
}

pub fn inc_search_max_score(score: f32) {
    METRIC_SEARCH_MAX_SCORE.observe(score as f64);
}

pub fn inc_ingest(outcome: &str) {
    METRIC_INGEST_COUNT.with_label_values(&[outcome]).inc();
}

pub fn inc_guard_rejected(tier: &str) {
    METRIC_GUARD_REJECTED.with_label_values(&[tier]).inc();
}

pub fn inc_guard_fail_open() {
    METRIC_GUARD_FAIL_OPEN.inc();
}

pub fn inc_proxy_transition(state: &str) {
    METRIC_PROXY_TRANSITION.with_label_values(&[state]).inc();
}

/// 以 Prometheus 文本格式导出所有指标
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    encoder.encode_to_string(&prometheus::gather()).unwrap_or_default()
}
