//! Log initialization for embedding hosts.
//!
//! The runtime itself only emits `tracing` events; hosts that do not install
//! their own subscriber get a formatted stdout layer filtered through the
//! `OFFLOAD_LOG` environment variable, with the configured level as the
//! fallback directive.

use tracing_subscriber::filter::EnvFilter;

use crate::config::Config;

const LOG_ENV: &str = "OFFLOAD_LOG";

/// Installs a global stdout subscriber. Safe to call more than once; later
/// calls (or an already-installed subscriber) are no-ops.
pub fn init_log(config: &Config) {
    let filter = EnvFilter::builder()
        .with_default_directive(config.log_level.parse().expect("invalid log level"))
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
