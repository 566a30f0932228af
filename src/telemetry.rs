//! Tracing initialization for binaries and tests.
//!
//! The engine itself only emits through the `tracing` macros (cross-tenant
//! audit events use the `audit` target); hosts decide how those events are
//! collected. [`init_tracing`] wires up the conventional stack: an
//! `EnvFilter` honoring `RUST_LOG`, a fmt layer, and `tracing_error`'s
//! `ErrorLayer` so span traces attach to diagnostics.

use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the default subscriber. Call once at process start; later calls
/// return an error from the underlying registry and can be ignored in
/// tests.
pub fn init_tracing() {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,flowline=info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .try_init()
        .ok();
}
