//! `tracing` subscriber setup.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over `level` when set. With `json` enabled
/// each event is emitted as one JSON object per line, otherwise the compact
/// human-readable format is used. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // set_global_default fails harmlessly if a subscriber is already installed
    if json {
        let _ = builder.json().with_current_span(true).try_init();
    } else {
        let _ = builder.compact().try_init();
    }
}
