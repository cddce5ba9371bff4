//! Tracing setup. Logs always go to stderr; stdout is reserved for the
//! binary stream.

use crate::error::{BlocksyncError, Result};
use tracing_subscriber::EnvFilter;

/// Default filter directive for a verbosity level.
pub fn level_for(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "warn";
    }
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the verbosity flags.
pub fn init_logging(verbosity: u8, quiet: bool) -> Result<()> {
    let level = level_for(verbosity, quiet);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("blocksync={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbosity >= 2)
        .with_thread_names(verbosity >= 2)
        .try_init()
        .map_err(|e| BlocksyncError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for_verbosity() {
        assert_eq!(level_for(0, false), "info");
        assert_eq!(level_for(1, false), "debug");
        assert_eq!(level_for(5, false), "trace");
        assert_eq!(level_for(0, true), "warn");
    }

    #[test]
    fn test_second_init_is_an_error() {
        // Another test may have installed the global subscriber first.
        let _ = init_logging(0, true);
        let err = init_logging(0, true).unwrap_err();
        assert!(matches!(err, BlocksyncError::Logging(_)));
        assert_eq!(err.exit_code(), crate::error::exit_code::FAILURE);
    }
}
