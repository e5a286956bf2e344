//! Process-wide log sink.
//!
//! The only global state in the crate. Binaries and tests call [`init`]
//! once; the filter follows `RUST_LOG` so protocol traffic can be
//! inspected with `RUST_LOG=telepathy=trace` without recompiling.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the tracing subscriber. Safe to call more than once; later
/// calls are ignored.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init();
}
