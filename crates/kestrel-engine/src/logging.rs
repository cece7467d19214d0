//! `tracing` subscriber setup for hosts that do not install their own.

use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

/// Install a compact `fmt` subscriber filtered at `level`.
///
/// `RUST_LOG`, when set, takes precedence over `level`. Returns `false` if a
/// global subscriber was already installed, which makes repeated calls (one
/// per engine, say) harmless.
pub fn init_tracing(level: LogLevel) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        let _ = init_tracing(LogLevel::Off);
        assert!(!init_tracing(LogLevel::Debug));
    }
}
