//! Metric keys used by the service.

/// Number of admitted sign requests.
pub const METRICS_KEY_SIGN_SUCCESS: &str = "tip.sign.success";
/// Number of sign requests rejected by the keeper.
pub const METRICS_KEY_SIGN_REJECTED: &str = "tip.sign.rejected";
/// Number of watch lookups served.
pub const METRICS_KEY_WATCH: &str = "tip.watch";

/// Sets metadata on all metrics via the `metrics` crate.
pub fn describe_metrics() {
    metrics::describe_counter!(
        METRICS_KEY_SIGN_SUCCESS,
        metrics::Unit::Count,
        "Number of admitted sign requests"
    );
    metrics::describe_counter!(
        METRICS_KEY_SIGN_REJECTED,
        metrics::Unit::Count,
        "Number of sign requests rejected by the keeper"
    );
    metrics::describe_counter!(
        METRICS_KEY_WATCH,
        metrics::Unit::Count,
        "Number of watch lookups served"
    );
}
