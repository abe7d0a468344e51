use tracing_subscriber::{EnvFilter, fmt};

use crate::settings::state::DEFAULT_LOG_FILTER;

/// Installs the global fmt subscriber.
///
/// `RUST_LOG` wins over `filter` when set. Returns `false` if a subscriber was
/// already installed, which makes repeated calls harmless.
pub fn init_tracing(filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}
