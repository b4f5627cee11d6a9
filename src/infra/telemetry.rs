use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
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
            "renderpool_engine_launch_total",
            Unit::Count,
            "Total number of engine process launches attempted."
        );
        describe_counter!(
            "renderpool_engine_launch_failed_total",
            Unit::Count,
            "Total number of engine process launches that failed."
        );
        describe_counter!(
            "renderpool_engine_dispose_total",
            Unit::Count,
            "Total number of engine processes disposed."
        );
        describe_counter!(
            "renderpool_pages_created_total",
            Unit::Count,
            "Total number of pages handed out by resolvers."
        );
        describe_counter!(
            "renderpool_orphaned_pages_total",
            Unit::Count,
            "Total number of untracked pages found during idle disposal."
        );
        describe_histogram!(
            "renderpool_render_ms",
            Unit::Milliseconds,
            "End-to-end capture latency in milliseconds."
        );
    });
}
