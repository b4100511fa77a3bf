//! Subscriber setup for the engine's `tracing` output.

use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Installs a global subscriber filtered by `RUST_LOG`, `jobslug=info` when
/// it is unset. Later calls are no-ops.
///
/// `debug` shows primary and repeat decisions, invalidations and guard
/// releases; `trace` adds turn-lock and semaphore grants.
pub fn init() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jobslug=info"));

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .try_init();
    });
}
