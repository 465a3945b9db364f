use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// sqlx logs every statement at info; keep it to warnings unless asked.
const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Install the global tracing subscriber. `RUST_LOG` replaces the default
/// filter entirely. A second call is a no-op.
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok();

    if installed {
        info!("Logging initialized");
    }
}
