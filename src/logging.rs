//! Tracing setup for the `askbridge` binary and embedding hosts.
//!
//! Events go to stderr so stdout stays free for protocol output. `RUST_LOG`
//! takes precedence over the configured default level.

use tracing_subscriber::EnvFilter;

/// Install a compact stderr subscriber.
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(default_level: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}
