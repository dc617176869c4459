//! Tracing subscriber setup for binaries and tests.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to the embedding application.

use tracing_subscriber::EnvFilter;

/// Install a stderr fmt subscriber filtered by `RUST_LOG`.
///
/// With `verbose`, everything down to `TRACE` is shown regardless of
/// `RUST_LOG`. Returns `false` if a global subscriber was already set (e.g.
/// by another test), which is harmless.
pub fn init_tracing(verbose: bool) -> bool {
    let filter = if verbose {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        let _ = init_tracing(false);
        assert!(!init_tracing(true));
    }
}
