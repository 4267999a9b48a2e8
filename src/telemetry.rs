//! Logging bootstrap for embedding applications and tests.

use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `streamtrack=debug`.
pub const LOG_ENV: &str = "STREAMTRACK_LOG";

/// Install a stderr fmt subscriber filtered by `STREAMTRACK_LOG`, falling
/// back to `default_filter`.
///
/// Returns `false` if a global subscriber was already installed, which
/// makes it safe to call from every test.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));
    let ansi = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .try_init()
        .is_ok()
}
