//! Tracing setup shared by the server binary and tools.
//!
//! Filtering comes from `RUST_LOG`; without it `default_directive` applies.
//! Output goes to stderr in compact format.
//!
//! # Example
//! ```bash
//! RUST_LOG=runhost=debug,tower_http=debug runhost-server --spec apispec.json
//! ```

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_DIRECTIVE: &str = "runhost=info,runhost_server=info";

/// Initialize the global tracing subscriber.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
