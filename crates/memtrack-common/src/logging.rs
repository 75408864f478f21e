use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable controlling log verbosity (debug, trace, info, warn, error).
pub const LOG_ENV: &str = "MEMTRACK_LOG";

/// Initialize structured logging with environment filter.
/// Set MEMTRACK_LOG=debug to see every tracked object transition.
pub fn init_logging() {
    init_logging_with("info");
}

/// Like [`init_logging`], but with a caller-chosen fallback filter used when
/// MEMTRACK_LOG is unset. Safe to call more than once; later calls are ignored.
pub fn init_logging_with(default_filter: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}
