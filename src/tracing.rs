use tracing_subscriber::{fmt, EnvFilter};

use crate::util::env::env_opt;

/// Sets up the global tracing subscriber with a fmt formatter and env filter.
///
/// `default_filter` applies when `RUST_LOG` is not set. `LOG_FORMAT=compact`
/// switches to the single-line formatter used on the ingestion hosts.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .with_file(true);

    let result = if env_opt("LOG_FORMAT").as_deref() == Some("compact") {
        builder.compact().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
