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
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "kinfeed_cache_hit_total",
            Unit::Count,
            "Total number of keyed cache hits."
        );
        describe_counter!(
            "kinfeed_cache_miss_total",
            Unit::Count,
            "Total number of keyed cache misses."
        );
        describe_counter!(
            "kinfeed_cache_flush_total",
            Unit::Count,
            "Total number of full cache flushes."
        );
        describe_histogram!(
            "kinfeed_cache_load_ms",
            Unit::Milliseconds,
            "Loader latency for cache recomputes in milliseconds."
        );
        describe_counter!(
            "kinfeed_feed_events_total",
            Unit::Count,
            "Total number of domain events handled by the feed updater."
        );
        describe_counter!(
            "kinfeed_feed_events_dropped_total",
            Unit::Count,
            "Total number of undecodable domain events discarded."
        );
        describe_counter!(
            "kinfeed_feed_fanout_failures_total",
            Unit::Count,
            "Total number of per-subscriber feed reloads or publishes that failed."
        );
        describe_histogram!(
            "kinfeed_feed_dispatch_ms",
            Unit::Milliseconds,
            "Time spent handling one domain event in milliseconds."
        );
        describe_counter!(
            "kinfeed_notify_failures_total",
            Unit::Count,
            "Total number of domain events that could not be published."
        );
        describe_gauge!(
            "kinfeed_live_subscriptions",
            Unit::Count,
            "Current number of open live update subscriptions."
        );
        describe_gauge!(
            "kinfeed_live_consumers",
            Unit::Count,
            "Current number of per-user broker consumers."
        );
    });
}
