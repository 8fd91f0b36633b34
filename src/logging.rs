//! One-shot `tracing_subscriber` installer, mirroring pb-file-tree's
//! env-filter-driven setup.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a global `tracing` subscriber driven by `RUST_LOG` (defaulting
/// to `info` if unset). Safe to call more than once; only the first call
/// takes effect.
pub fn init_logging() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}
