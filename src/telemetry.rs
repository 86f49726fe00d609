//! Metric names and descriptions for the segmentation engine.

use std::sync::Once;

use metrics::{Unit, describe_counter};

pub const METRIC_VARY_HEADER: &str = "segvary_vary_header_total";
pub const METRIC_COOKIE_WRITE: &str = "segvary_cookie_write_total";
pub const METRIC_COOKIE_DECRYPT_FAILURE: &str = "segvary_cookie_decrypt_failure_total";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Register metric descriptions with the installed recorder.
///
/// Safe to call from multiple places; descriptions are registered once per
/// process.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_VARY_HEADER,
            Unit::Count,
            "Total number of responses that received a segmentation or auth Vary header."
        );
        describe_counter!(
            METRIC_COOKIE_WRITE,
            Unit::Count,
            "Total number of segmentation cookie writes (including removal cookies)."
        );
        describe_counter!(
            METRIC_COOKIE_DECRYPT_FAILURE,
            Unit::Count,
            "Total number of inbound segmentation cookies that failed authentication."
        );
    });
}
