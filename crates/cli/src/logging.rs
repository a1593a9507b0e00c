//! Tracing subscriber setup for the `payplan` binary.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "payplan=info";

/// Install the global subscriber. Logs go to stderr so stdout stays JSON.
///
/// The filter comes from `PAYPLAN_LOG`, then `RUST_LOG`, then the default.
pub fn init() {
    let filter = std::env::var("PAYPLAN_LOG")
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    // A second init (e.g. in tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
