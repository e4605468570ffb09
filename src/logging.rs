//! Diagnostic output setup for the binary.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over the verbosity flags.
pub fn init(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}
