//! Logger initialization for the daemon binaries.

use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber.
///
/// Production mode logs compactly at DEBUG; `--dev` switches to a prettier
/// console format at TRACE. `RUST_LOG` overrides either default.
pub fn init(dev: bool) {
    let filter = |default: &str| {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    };

    if !dev {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter("debug"))
            .init();
        return;
    }

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(filter("trace"))
        .init();

    warn!("********** DEV MODE - UNSAFE IN PRODUCTION! **********");
}
