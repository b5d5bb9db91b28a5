//! Log subscriber setup shared by both binaries.

use tracing_subscriber::EnvFilter;

/// Filter directive for the given verbosity and configured level
///
/// `-v` always means `debug`; otherwise the configured level applies.
#[must_use]
pub fn directive(verbose: bool, level: &str) -> String {
    if verbose {
        "debug".to_string()
    } else {
        level.to_lowercase()
    }
}

/// Install the global subscriber, writing to stderr
///
/// `RUST_LOG` takes precedence over `verbose` and `level`. Stdout stays
/// reserved for chat lines and user-facing notices.
pub fn init(verbose: bool, level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive(verbose, level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive() {
        assert_eq!(directive(false, "info"), "info");
        assert_eq!(directive(false, "WARN"), "warn");
        assert_eq!(directive(true, "warn"), "debug");
    }
}
