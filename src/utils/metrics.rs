use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};
use std::sync::LazyLock;

/// Total number of endpoint ejections, broken down by detection algorithm.
///
/// The `algorithm` label is `success_rate` or `failure_percentage`.
/// Use to see which detection path is doing the work.
/// Example query: `rate(outlier_detection_ejections_total[5m])`.
pub static EJECTIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "outlier_detection_ejections_total",
        "Total number of endpoint ejections per algorithm",
        &["algorithm"]
    )
    .unwrap()
});

/// Total number of endpoints returned to service after their back-off expired.
///
/// Example query: `rate(outlier_detection_unejections_total[5m])`.
pub static UNEJECTIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "outlier_detection_unejections_total",
        "Total number of endpoints returned to service"
    )
    .unwrap()
});

/// Number of endpoints currently ejected.
///
/// Updated after every evaluation pass. Compare against
/// `outlier_detection_tracked_endpoints` for the ejected fraction.
pub static EJECTED_ENDPOINTS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("outlier_detection_ejected_endpoints", "Endpoints currently ejected")
        .unwrap()
});

/// Number of endpoints in the policy's map.
///
/// Set on every address update.
pub static TRACKED_ENDPOINTS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("outlier_detection_tracked_endpoints", "Endpoints currently tracked")
        .unwrap()
});

/// Total number of evaluation passes run by the ejection timer.
///
/// Example query: `rate(outlier_detection_evaluations_total[5m])` should track
/// `1 / interval` while counting is enabled.
pub static EVALUATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "outlier_detection_evaluations_total",
        "Total number of evaluation passes"
    )
    .unwrap()
});
