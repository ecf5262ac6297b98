//! Tracing subscriber setup shared by the binaries.

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `debug` selects verbose output for this
/// crate and everything else stays at `warn`.
pub fn init(debug: bool) {
    let default_directive = if debug {
        "cody=debug,warn"
    } else {
        "cody=info,warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    // A second init (tests, repeated CLI setup) is harmless; keep the first.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
