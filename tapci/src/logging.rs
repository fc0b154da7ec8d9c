//! Diagnostics for developing and debugging tapci itself.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG`. The product output
//! (phase headers, step headlines, workflow commands) is printed to stdout by
//! the phases, and the result files are written by [`crate::junit`]; neither
//! depends on the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "warn,tapci=info" } else { "warn" }
}

/// Install the global subscriber. Call once, from `main`.
///
/// ```bash
/// RUST_LOG=tapci=debug tapci --dry-run HEAD
/// ```
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact().with_target(false))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_own_level_only() {
        assert_eq!(default_directive(false), "warn");
        assert!(default_directive(true).parse::<EnvFilter>().is_ok());
        assert!(default_directive(true).starts_with("warn,"));
    }
}
