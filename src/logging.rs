use tracing_subscriber::EnvFilter;

/// Filter directives for the fmt subscriber, e.g. `debug` or `hub_cache=trace`.
pub const LOG_ENV: &str = "HUB_CACHE_LOG";

/// Installs a compact global subscriber. A subscriber that is already
/// installed is left in place.
pub fn setup_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
