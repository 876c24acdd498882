//! Shared support for the integration suites.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs the tracing subscriber once per test binary. `RUST_LOG`
/// selects what gets printed; output is captured per test.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
