//! Logging setup. The teacher mixes `log` + `flexi_logger` with an
//! OpenTelemetry layer; this daemon has no collector to ship spans to, so
//! logging is standardized on `tracing` + `tracing-subscriber` alone, the
//! simpler half of the teacher's own stack.

use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber. `verbose` forces debug
/// level regardless of `RUST_LOG`, matching the `-v` flag's effect in
/// `examples/original_source/src/pvdd.c` (`lFlagVerbose`).
pub fn init(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // A subscriber is already installed (e.g. under `cargo test`); not
        // an error worth failing startup over.
        tracing::warn!("tracing subscriber already initialized");
    }
}
