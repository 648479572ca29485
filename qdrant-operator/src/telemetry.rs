//! Tracing setup for the operator binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level is `info`, or `debug` when
/// the debug flag is on.
pub fn init(debug: bool) {
    let default_directive = if debug { "debug,hyper=info,tower=info" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
