//! Structured logging for the resolver binary.
//!
//! This installs a `tracing_subscriber` formatting layer, env-filtered via
//! `RUST_LOG`. It is `tracing`-only: the resolver core's `metrics.rs` records
//! against `opentelemetry::global::meter`, but this binary never installs an
//! OTel SDK meter or tracer provider, so those recordings currently resolve
//! against OTel's no-op default. Wiring a real `opentelemetry_sdk` /
//! `opentelemetry-otlp` exporter here is future work, not yet done — see
//! DESIGN.md's dependency notes for why those crates aren't in this binary's
//! `Cargo.toml` today.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global `tracing` subscriber.
///
/// # Configuration
///
/// Environment variables:
/// - `RUST_LOG`: log filter (default: `info,resolver_server=debug,resolver_xmpp=debug`)
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,resolver_server=debug,resolver_xmpp=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    tracing::info!("telemetry initialized");

    Ok(())
}

/// Shutdown telemetry, flushing any pending spans.
pub fn shutdown() {
    tracing::info!("telemetry shutdown complete");
}
