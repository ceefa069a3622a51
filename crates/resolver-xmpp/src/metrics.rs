//! Resolver metrics for observability.
//!
//! Records against the global OpenTelemetry meter provider. The resolver
//! core never configures exporters itself — a host binary would install a
//! real meter provider at startup the same way it installs its `tracing`
//! subscriber; `resolver-server` does not currently do so (see
//! `telemetry.rs`), so these recordings resolve against OTel's no-op
//! default until that wiring exists.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("resolver-xmpp"))
}

/// Counter for stanzas dispatched through the router, by kind and outcome.
pub fn stanzas_routed() -> Counter<u64> {
    meter()
        .u64_counter("resolver.stanzas.routed")
        .with_description("Total stanzas dispatched by the stanza router")
        .with_unit("stanza")
        .build()
}

/// Counter for lookup fan-outs started, by kind (`probe`, `last_activity`).
pub fn lookups_started() -> Counter<u64> {
    meter()
        .u64_counter("resolver.lookups.started")
        .with_description("Total cluster-wide lookups fanned out")
        .with_unit("lookup")
        .build()
}

/// Counter for how a lookup completed: `collected`, `timeout`, or `error`.
pub fn lookups_completed() -> Counter<u64> {
    meter()
        .u64_counter("resolver.lookups.completed")
        .with_description("Total cluster-wide lookups resolved, by completion reason")
        .with_unit("lookup")
        .build()
}

/// Gauge for the number of bare JIDs currently tracked as available.
pub fn presence_cache_size() -> Gauge<i64> {
    meter()
        .i64_gauge("resolver.presence_cache.size")
        .with_description("Current number of users with at least one online resource")
        .with_unit("user")
        .build()
}

/// Gauge for the number of distinct watched JIDs with subscribers.
pub fn subscription_registry_size() -> Gauge<i64> {
    meter()
        .i64_gauge("resolver.subscription_registry.size")
        .with_description("Current number of watched JIDs with at least one subscriber")
        .with_unit("user")
        .build()
}

/// Histogram for how long a lookup fan-out took to settle.
pub fn lookup_latency() -> Histogram<f64> {
    meter()
        .f64_histogram("resolver.lookup.latency")
        .with_description("Lookup fan-out settle time")
        .with_unit("ms")
        .build()
}

/// Record a stanza routed through a given handler, with its outcome.
pub fn record_routed(kind: &str, outcome: &str) {
    stanzas_routed().add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ],
    );
}

/// Record a lookup fan-out starting.
pub fn record_lookup_started(kind: &str) {
    lookups_started().add(1, &[KeyValue::new("kind", kind.to_string())]);
}

/// Record a lookup fan-out completing, and how long it took.
pub fn record_lookup_completed(kind: &str, reason: &str, latency_ms: f64) {
    lookups_completed().add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("reason", reason.to_string()),
        ],
    );
    lookup_latency().record(latency_ms, &[KeyValue::new("kind", kind.to_string())]);
}
