//! Opt-in tracing initialization for binaries and tests.
//!
//! Libraries must not install a global subscriber on their own, so this
//! is a helper the embedding process calls once. `RUST_LOG` overrides
//! the default filter.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Install a stderr subscriber. Calling it twice is harmless: the
/// second call leaves the first subscriber in place.
pub fn init() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("xmppd_core=info,info")
    };

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(filter))
        .try_init();
}
