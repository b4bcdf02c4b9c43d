use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Initialize structured logging.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more
/// than once is harmless; later calls leave the first subscriber in place.
pub fn init_telemetry(observability: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&observability.log_level))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if observability.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };

    if installed.is_ok() {
        tracing::info!(json = observability.json, "Tickframe telemetry initialized");
    }
    Ok(())
}

/// Generate a correlation ID for linking the log lines of one module instance
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping everything a module instance does
pub fn create_module_span(module: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "module",
        module.name = module,
        correlation.id = correlation_id,
    )
}

/// Span wrapping one orchestrator's tick
pub fn create_orchestrator_span(orchestrator: &str, depth: usize) -> tracing::Span {
    tracing::debug_span!(
        "orchestrator",
        orchestrator.name = orchestrator,
        orchestrator.depth = depth,
    )
}
