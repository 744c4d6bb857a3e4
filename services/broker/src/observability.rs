// Logging and metrics bootstrap for the daemon.
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogLevel};

/// Initialise the global tracing subscriber from the daemon flags.
/// `RUST_LOG` still wins when set, so operators can turn individual targets
/// up or down without restarting with different flags.
pub fn init_logging(config: &Config) {
    let default_directive = match config.level {
        LogLevel::Disabled => return,
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    if config.human {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    }
}

/// Install the process-wide Prometheus recorder. The returned handle renders
/// the scrape body for the HTTP `/metrics` route.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}
