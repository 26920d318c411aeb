use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the cache emits. Safe to call more
/// than once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "cascade_cache_hit_total",
            Unit::Count,
            "Total number of cache reads that found a decodable entry."
        );
        describe_counter!(
            "cascade_cache_miss_total",
            Unit::Count,
            "Total number of cache reads that returned nothing."
        );
        describe_counter!(
            "cascade_cache_corrupt_total",
            Unit::Count,
            "Total number of undecodable entries dropped on read."
        );
        describe_counter!(
            "cascade_cache_compute_total",
            Unit::Count,
            "Total number of get-or-compute factory invocations."
        );
        describe_counter!(
            "cascade_cache_store_error_total",
            Unit::Count,
            "Total number of failed store calls, labelled by operation."
        );
        describe_gauge!(
            "cascade_cache_key_locks",
            Unit::Count,
            "Current number of registered per-key locks."
        );
        describe_histogram!(
            "cascade_cache_pattern_delete_ms",
            Unit::Milliseconds,
            "Delete-by-pattern latency in milliseconds."
        );
        describe_histogram!(
            "cascade_cache_invalidation_ms",
            Unit::Milliseconds,
            "Entity invalidation latency in milliseconds, cascades included."
        );
    });
}
