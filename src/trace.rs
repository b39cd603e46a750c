//! Opt-in logging setup.
//!
//! The library only emits `tracing` events. Applications that do not install
//! their own subscriber can call [`init_logging`].

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `hvcore=debug`.
pub const LOG_ENV: &str = "HVCORE_LOG";

/// Install a `fmt` subscriber filtered by [`LOG_ENV`] (default `warn`).
///
/// Returns `false` if a global subscriber was already set.
pub fn init_logging() -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        init_logging();
        assert!(!init_logging());
    }
}
