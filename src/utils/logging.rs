use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` takes precedence over
/// `default_directive`. Targets stay visible so `audit` records stand out.
/// Returns false if a subscriber was already installed.
pub fn init(default_directive: &str) -> bool {
    let fmt_layer = fmt::layer().with_target(true);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}
